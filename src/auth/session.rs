//! Playback session resolution
//!
//! Sessions are created and heartbeated by the playback subsystem; the
//! gate only reads them for the concurrent-stream count and to attach
//! the current session to a request.

use chrono::Duration;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::AppError;
use crate::model::{Identity, Session};
use crate::store::SessionStore;

/// Reads sessions on behalf of the gate
pub struct SessionResolver {
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    /// Sessions idle longer than this are treated as terminated even if
    /// the playback subsystem has not flipped the flag yet
    pub idle_ttl: Duration,
}

impl SessionResolver {
    pub fn new(sessions: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            clock,
            idle_ttl: Duration::minutes(30),
        }
    }

    /// The live session for this identity on this device, if any
    pub async fn resolve(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> Result<Option<Session>, AppError> {
        let session = self
            .sessions
            .find_active_session(&identity.id, device_id)
            .await?;
        let now = self.clock.now();
        Ok(session.filter(|s| s.is_live(now, self.idle_ttl)))
    }

    /// Number of live sessions counted against the stream limit
    ///
    /// Applies the same idle cutoff as [`resolve`](Self::resolve), so a
    /// session that stopped heartbeating does not hold a slot forever.
    pub async fn active_count(&self, identity: &Identity) -> Result<u32, AppError> {
        let live_after = self.clock.now() - self.idle_ttl;
        Ok(self
            .sessions
            .count_active_sessions_for_owner(&identity.id, live_after)
            .await?)
    }
}
