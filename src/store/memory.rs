//! In-memory store implementation
//!
//! Backs the crate's own tests and host integration tests. Not intended
//! for production use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{DeviceStore, PlanStore, SessionStore, StoreError, StoreResult, UserStore};
use crate::model::{Device, Identity, Plan, Session, TrustState};

#[derive(Default)]
struct Inner {
    users: HashMap<String, Identity>,
    devices: HashMap<String, Device>,
    sessions: HashMap<String, Session>,
    plans: HashMap<String, Plan>,
}

/// All four store traits over in-process maps
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: Identity) {
        self.inner.write().await.users.insert(user.id.clone(), user);
    }

    pub async fn insert_device(&self, device: Device) {
        self.inner
            .write()
            .await
            .devices
            .insert(device.id.clone(), device);
    }

    pub async fn insert_session(&self, session: Session) {
        self.inner
            .write()
            .await
            .sessions
            .insert(session.token.clone(), session);
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.inner.write().await.plans.insert(plan.id.clone(), plan);
    }

    /// Snapshot of one device, for test assertions
    pub async fn device(&self, id: &str) -> Option<Device> {
        self.inner.read().await.devices.get(id).cloned()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_id(&self, id: &str) -> StoreResult<Option<Identity>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find_device_by_id(&self, id: &str) -> StoreResult<Option<Device>> {
        Ok(self.inner.read().await.devices.get(id).cloned())
    }

    async fn find_device_by_fingerprint(
        &self,
        owner_id: &str,
        fingerprint: &str,
    ) -> StoreResult<Option<Device>> {
        Ok(self
            .inner
            .read()
            .await
            .devices
            .values()
            .find(|d| d.owner_id == owner_id && d.fingerprint() == fingerprint)
            .cloned())
    }

    async fn list_devices_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Device>> {
        let mut devices: Vec<Device> = self
            .inner
            .read()
            .await
            .devices
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn count_devices_for_owner(&self, owner_id: &str) -> StoreResult<u32> {
        Ok(self
            .inner
            .read()
            .await
            .devices
            .values()
            .filter(|d| d.owner_id == owner_id && d.trust_state != TrustState::Blocked)
            .count() as u32)
    }

    async fn create_device(&self, device: Device) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.devices.contains_key(&device.id) {
            return Err(StoreError::Integrity(format!(
                "device {} already exists",
                device.id
            )));
        }
        inner.devices.insert(device.id.clone(), device);
        Ok(())
    }

    async fn update_trust_state(&self, id: &str, state: TrustState) -> StoreResult<()> {
        if let Some(device) = self.inner.write().await.devices.get_mut(id) {
            device.trust_state = state;
        }
        Ok(())
    }

    async fn update_last_seen(
        &self,
        id: &str,
        at: DateTime<Utc>,
        addr: Option<String>,
    ) -> StoreResult<()> {
        if let Some(device) = self.inner.write().await.devices.get_mut(id) {
            device.last_seen_at = at;
            if addr.is_some() {
                device.last_seen_addr = addr;
            }
        }
        Ok(())
    }

    async fn delete_device(&self, id: &str) -> StoreResult<()> {
        self.inner.write().await.devices.remove(id);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_active_session(
        &self,
        owner_id: &str,
        device_id: &str,
    ) -> StoreResult<Option<Session>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .find(|s| {
                s.active && s.owner_id == owner_id && s.device_id.as_deref() == Some(device_id)
            })
            .cloned())
    }

    async fn count_active_sessions_for_owner(
        &self,
        owner_id: &str,
        live_after: DateTime<Utc>,
    ) -> StoreResult<u32> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.active && s.owner_id == owner_id && s.last_activity_at >= live_after)
            .count() as u32)
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn find_plan_by_id(&self, id: &str) -> StoreResult<Option<Plan>> {
        Ok(self.inner.read().await.plans.get(id).cloned())
    }
}
