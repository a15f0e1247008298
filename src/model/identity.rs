//! Resolved principal and subscription state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of an authenticated principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Subscriber,
    Guest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Subscriber => "subscriber",
            Role::Guest => "guest",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "subscriber" => Ok(Role::Subscriber),
            "guest" => Ok(Role::Guest),
            _ => Err(()),
        }
    }
}

/// Billing status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

/// Subscription reference carried by an [`Identity`]
///
/// Owned by the billing subsystem; the gate only reads these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Set by billing when the plan changed (upgrade or downgrade).
    /// Drives the device-limit grace window after a downgrade.
    #[serde(default)]
    pub plan_changed_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Whether the subscription entitles the owner to service at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && now <= self.period_end
    }
}

/// Resolved principal for one request
///
/// Immutable for the lifetime of a request; reloaded fresh per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
    pub active: bool,
    pub subscription: Option<Subscription>,
}

impl Identity {
    /// Admins bypass entitlement checks (never auth or rate limits)
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
