//! Subscription plans: limits and feature flags
//!
//! Plans are owned by the billing subsystem and read-only from the
//! pipeline's perspective.

use super::device::DeviceKind;
use serde::{Deserialize, Serialize};

/// Reserved limit value meaning "no limit"
pub const UNLIMITED: i32 = -1;

/// Gated product feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    UltraHd,
    Hdr,
    Downloads,
    OfflineViewing,
}

/// A feature a plan grants, optionally excluding some device kinds
///
/// A plan may permit a feature in general but disallow it on specific
/// device types (e.g. downloads everywhere except TVs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureGrant {
    pub feature: Feature,
    #[serde(default)]
    pub excluded_kinds: Vec<DeviceKind>,
}

impl FeatureGrant {
    pub fn new(feature: Feature) -> Self {
        Self {
            feature,
            excluded_kinds: Vec::new(),
        }
    }

    pub fn except(mut self, kind: DeviceKind) -> Self {
        self.excluded_kinds.push(kind);
        self
    }
}

/// Subscription tier definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Maximum non-blocked devices, [`UNLIMITED`] for no limit
    pub device_limit: i32,
    /// Maximum concurrent streams, [`UNLIMITED`] for no limit
    pub simultaneous_streams: i32,
    /// Device kinds the plan permits at registration
    pub allowed_device_kinds: Vec<DeviceKind>,
    pub features: Vec<FeatureGrant>,
}

impl Plan {
    /// Synthetic no-limit plan for principals without a subscription
    /// record, e.g. administrators
    pub fn internal_unlimited() -> Self {
        Self {
            id: "internal-unlimited".to_string(),
            name: "Internal".to_string(),
            device_limit: UNLIMITED,
            simultaneous_streams: UNLIMITED,
            allowed_device_kinds: vec![
                DeviceKind::Web,
                DeviceKind::Mobile,
                DeviceKind::Tablet,
                DeviceKind::Tv,
                DeviceKind::Desktop,
                DeviceKind::Other,
            ],
            features: vec![
                FeatureGrant::new(Feature::UltraHd),
                FeatureGrant::new(Feature::Hdr),
                FeatureGrant::new(Feature::Downloads),
                FeatureGrant::new(Feature::OfflineViewing),
            ],
        }
    }

    /// Whether the plan places no bound on device count
    pub fn unlimited_devices(&self) -> bool {
        self.device_limit == UNLIMITED
    }

    /// Whether the plan places no bound on concurrent streams
    pub fn unlimited_streams(&self) -> bool {
        self.simultaneous_streams == UNLIMITED
    }

    /// Whether devices of `kind` may be registered under this plan
    pub fn allows_kind(&self, kind: DeviceKind) -> bool {
        self.allowed_device_kinds.contains(&kind)
    }

    /// Look up the grant for `feature`, if the plan includes it
    pub fn grant(&self, feature: Feature) -> Option<&FeatureGrant> {
        self.features.iter().find(|g| g.feature == feature)
    }
}
