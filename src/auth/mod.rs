//! Access-control components composed by the gate pipeline

mod device;
mod entitlement;
mod rate_limit;
mod session;
mod token;

pub use device::{DeviceResolver, RegisterOutcome};
pub use entitlement::{
    check_device_limit, check_feature_access, check_stream_limit, EntitlementChecker,
    LimitDecision,
};
pub use rate_limit::{
    CounterStore, KeyBy, MemoryCounters, RateClass, RateDecision, RateLimiter, RateQuota,
};
pub use session::SessionResolver;
pub use token::{AuthError, Claims, TokenAuthenticator, TokenConfig};
