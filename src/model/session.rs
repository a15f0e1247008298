//! Active streaming sessions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One active playback session bound to an identity (and usually a device)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub owner_id: String,
    pub device_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Updated on every playback heartbeat
    pub last_activity_at: DateTime<Utc>,
    pub content_id: Option<String>,
}

impl Session {
    /// Whether the session counts as live at `now`
    ///
    /// A session with no heartbeat for longer than `idle_ttl` is treated
    /// as terminated even if the store has not been updated yet.
    pub fn is_live(&self, now: DateTime<Utc>, idle_ttl: Duration) -> bool {
        self.active && now - self.last_activity_at <= idle_ttl
    }
}
