//! Store interfaces consumed by the gate pipeline
//!
//! The host application implements these over its database. The pipeline
//! performs no multi-document transactions: each check is a single read
//! followed by at most one write to the entity it owns.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{AppError, ErrorCode};
use crate::model::{Device, Identity, Plan, Session, TrustState};

/// Store-level failure
///
/// Expected conditions (missing records) are `Option`s on the trait
/// methods; these errors are unexpected backend failures and surface to
/// clients as an opaque 503.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("data integrity: {0}")]
    Integrity(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "store failure");
        AppError::new(ErrorCode::StoreUnavailable)
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_id(&self, id: &str) -> StoreResult<Option<Identity>>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_device_by_id(&self, id: &str) -> StoreResult<Option<Device>>;

    async fn find_device_by_fingerprint(
        &self,
        owner_id: &str,
        fingerprint: &str,
    ) -> StoreResult<Option<Device>>;

    async fn list_devices_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Device>>;

    /// Count of non-blocked devices for an owner
    async fn count_devices_for_owner(&self, owner_id: &str) -> StoreResult<u32>;

    async fn create_device(&self, device: Device) -> StoreResult<()>;

    async fn update_trust_state(&self, id: &str, state: TrustState) -> StoreResult<()>;

    async fn update_last_seen(
        &self,
        id: &str,
        at: DateTime<Utc>,
        addr: Option<String>,
    ) -> StoreResult<()>;

    async fn delete_device(&self, id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_active_session(
        &self,
        owner_id: &str,
        device_id: &str,
    ) -> StoreResult<Option<Session>>;

    /// Count of active sessions heartbeated at or after `live_after`
    ///
    /// Sessions idle past the TTL are treated as terminated; the cutoff
    /// keeps them from occupying a stream slot forever.
    async fn count_active_sessions_for_owner(
        &self,
        owner_id: &str,
        live_after: DateTime<Utc>,
    ) -> StoreResult<u32>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn find_plan_by_id(&self, id: &str) -> StoreResult<Option<Plan>>;
}
