//! Domain model consumed by the gate pipeline
//!
//! These are the fields the pipeline reads; the full schemas are owned
//! by the user/billing subsystems.

mod device;
mod identity;
mod plan;
mod session;

pub use device::{fingerprint, Device, DeviceInfo, DeviceKind, TrustState};
pub use identity::{Identity, Role, Subscription, SubscriptionStatus};
pub use plan::{Feature, FeatureGrant, Plan, UNLIMITED};
pub use session::Session;
