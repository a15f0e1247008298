//! Subscription entitlement checks
//!
//! Answers "may this identity do this right now" from the subscription
//! and plan: device quota, concurrent stream quota, feature access.
//! Counts are read without a transaction (count-then-decide), so a
//! limit may briefly overshoot by one under concurrent registration;
//! [`crate::auth::DeviceResolver::enforce_device_limit`] corrects the
//! device count after the fact.

use chrono::Duration;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{AppError, ErrorCode};
use crate::model::{DeviceKind, Feature, Identity, Plan, Subscription};
use crate::store::PlanStore;

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    /// Slots left after this decision; `None` when the plan is unlimited
    pub remaining: Option<u32>,
}

impl LimitDecision {
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: None,
        }
    }
}

/// Device quota decision from a current count
///
/// `current` counts non-blocked devices only; blocked devices free
/// their slot.
pub fn check_device_limit(plan: &Plan, current: u32) -> LimitDecision {
    if plan.unlimited_devices() {
        return LimitDecision::unlimited();
    }
    let limit = plan.device_limit.max(0) as u32;
    LimitDecision {
        allowed: current < limit,
        remaining: Some(limit.saturating_sub(current)),
    }
}

/// Concurrent stream quota decision from a current count
pub fn check_stream_limit(plan: &Plan, current: u32) -> LimitDecision {
    if plan.unlimited_streams() {
        return LimitDecision::unlimited();
    }
    let limit = plan.simultaneous_streams.max(0) as u32;
    LimitDecision {
        allowed: current < limit,
        remaining: Some(limit.saturating_sub(current)),
    }
}

/// Whether `feature` is granted on a device of `kind`
pub fn check_feature_access(plan: &Plan, feature: Feature, kind: DeviceKind) -> bool {
    match plan.grant(feature) {
        Some(grant) => !grant.excluded_kinds.contains(&kind),
        None => false,
    }
}

/// Loads plans and applies the quota rules
pub struct EntitlementChecker {
    plans: Arc<dyn PlanStore>,
    clock: Arc<dyn Clock>,
    /// Window after a plan change during which an over-limit device
    /// count is tolerated instead of corrected
    pub downgrade_grace: Duration,
}

impl EntitlementChecker {
    pub fn new(plans: Arc<dyn PlanStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            plans,
            clock,
            downgrade_grace: Duration::hours(24),
        }
    }

    /// Resolve the active subscription and its plan, or reject
    ///
    /// Admins are never rejected here; callers short-circuit on
    /// [`Identity::is_admin`] before calling.
    pub async fn active_plan(&self, identity: &Identity) -> Result<Plan, AppError> {
        let now = self.clock.now();
        let subscription = identity
            .subscription
            .as_ref()
            .filter(|s| s.is_active(now))
            .ok_or_else(|| AppError::new(ErrorCode::SubscriptionRequired))?;

        self.plans
            .find_plan_by_id(&subscription.plan_id)
            .await?
            .ok_or_else(|| {
                tracing::error!(plan_id = %subscription.plan_id, "subscription references unknown plan");
                AppError::new(ErrorCode::InternalError)
            })
    }

    /// Whether the device count is inside the post-downgrade grace window
    pub fn in_downgrade_grace(&self, subscription: &Subscription) -> bool {
        match subscription.plan_changed_at {
            Some(changed_at) => self.clock.now() - changed_at <= self.downgrade_grace,
            None => false,
        }
    }
}
