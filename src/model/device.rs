//! Registered devices and the trust state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of client installation a device represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Web,
    Mobile,
    Tablet,
    Tv,
    Desktop,
    Other,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Web => "web",
            DeviceKind::Mobile => "mobile",
            DeviceKind::Tablet => "tablet",
            DeviceKind::Tv => "tv",
            DeviceKind::Desktop => "desktop",
            DeviceKind::Other => "other",
        }
    }
}

/// Trust state of a registered device
///
/// An unregistered device has no record at all. States only advance
/// (pending → verified → trusted) or jump to blocked; they never regress
/// automatically. `Blocked` exits only via an administrator unblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    PendingVerification,
    Verified,
    Trusted,
    Blocked,
}

impl TrustState {
    /// Whether a device in this state may access verified-device endpoints
    pub fn is_usable(&self) -> bool {
        matches!(self, TrustState::Verified | TrustState::Trusted)
    }

    /// Valid explicit transitions of the state machine
    ///
    /// `Blocked → Verified` is the administrator unblock path; callers
    /// enforce the role check.
    pub fn can_transition_to(&self, next: TrustState) -> bool {
        use TrustState::*;
        matches!(
            (self, next),
            (PendingVerification, Verified)
                | (Verified, Trusted)
                | (Trusted, Verified)
                | (PendingVerification, Blocked)
                | (Verified, Blocked)
                | (Trusted, Blocked)
                | (Blocked, Verified)
        )
    }
}

/// One registered client installation bound to exactly one identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub owner_id: String,
    pub kind: DeviceKind,
    /// Declared name, e.g. "Living room TV"
    pub name: String,
    /// Declared platform, e.g. "tvOS 18"
    pub platform: String,
    pub trust_state: TrustState,
    pub last_seen_at: DateTime<Utc>,
    pub last_seen_addr: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Registration fingerprint of this device
    pub fn fingerprint(&self) -> String {
        fingerprint(self.kind, &self.platform, &self.name)
    }
}

/// Caller-supplied attributes for device registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub platform: String,
    pub name: String,
}

impl DeviceInfo {
    pub fn fingerprint(&self) -> String {
        fingerprint(self.kind, &self.platform, &self.name)
    }
}

/// Dedupe fingerprint over (kind, platform, declared name)
///
/// Registering the same fingerprint twice for one owner returns the
/// existing record unchanged.
pub fn fingerprint(kind: DeviceKind, platform: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(platform.as_bytes());
    hasher.update(b"|");
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}
