//! Access-control gate for a subscription streaming service
//!
//! Every protected request passes a fixed pipeline: maintenance check,
//! rate limiting, token authentication, device trust resolution, and
//! subscription entitlement. The pipeline is transport-agnostic; the
//! [`middleware`] module wires it into axum.
//!
//! ```ignore
//! let gate = Gate::builder()
//!     .config(GateConfig::from_env()?)
//!     .store(store)
//!     .build()?;
//!
//! let app = Router::new()
//!     .route("/stream", post(start_stream))
//!     .layer(Extension(GateRoute::new(EndpointConfig::stream_start())))
//!     .layer(middleware::from_fn_with_state(gate, gate_middleware));
//! ```

pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod model;
pub mod pipeline;
pub mod store;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use auth::{
    DeviceResolver, EntitlementChecker, KeyBy, RateClass, RateLimiter, RateQuota,
    SessionResolver, TokenAuthenticator, TokenConfig,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GateConfig;
pub use error::{ApiResponse, AppError, AppResult, ErrorCode};
pub use middleware::{auth_rate_limit, gate_middleware, GateRoute};
pub use model::{
    Device, DeviceInfo, DeviceKind, Feature, FeatureGrant, Identity, Plan, Role, Session,
    Subscription, SubscriptionStatus, TrustState, UNLIMITED,
};
pub use pipeline::{spawn_sweeper, EndpointConfig, Gate, GateBuilder, GateContext, GateRequest};
pub use store::{DeviceStore, MemoryStore, PlanStore, SessionStore, StoreError, UserStore};
