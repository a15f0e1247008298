//! Device registration, verification and trust transitions
//!
//! Owns every write to [`TrustState`]. Verification codes are short
//! numeric codes delivered out of band (the host sends the email or
//! push); they live in process with a short TTL and a bounded attempt
//! count.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

use super::entitlement::check_device_limit;
use crate::clock::Clock;
use crate::error::{AppError, ErrorCode};
use crate::model::{Device, DeviceInfo, Identity, Plan, TrustState};
use crate::store::DeviceStore;

const CODE_TTL_MINUTES: i64 = 10;
const MAX_VERIFY_ATTEMPTS: u32 = 5;

/// Result of a registration call
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub device: Device,
    /// Set when a fresh verification code was issued; `None` when the
    /// fingerprint matched an already-registered device.
    pub verification_code: Option<String>,
}

struct PendingCode {
    code: String,
    expires_at: DateTime<Utc>,
    attempts: u32,
}

/// Registers devices and drives the trust state machine
pub struct DeviceResolver {
    devices: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
    codes: DashMap<String, PendingCode>,
    /// Deployments that trust first use create devices directly in
    /// `Verified` and skip the code flow
    pub require_verification: bool,
}

impl DeviceResolver {
    pub fn new(devices: Arc<dyn DeviceStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            devices,
            clock,
            codes: DashMap::new(),
            require_verification: true,
        }
    }

    /// Register a device for an identity
    ///
    /// Registering the same (kind, platform, name) fingerprint twice
    /// returns the existing record unchanged. The quota check is
    /// count-then-decide: two concurrent registrations may both pass at
    /// `limit - 1`, overshooting by one; [`enforce_device_limit`]
    /// (Self::enforce_device_limit) corrects this later.
    pub async fn register(
        &self,
        identity: &Identity,
        plan: &Plan,
        info: &DeviceInfo,
        addr: Option<String>,
    ) -> Result<RegisterOutcome, AppError> {
        if !identity.is_admin() && !plan.allows_kind(info.kind) {
            return Err(AppError::new(ErrorCode::DeviceKindNotAllowed)
                .with_detail("kind", info.kind.as_str()));
        }

        if let Some(existing) = self
            .devices
            .find_device_by_fingerprint(&identity.id, &info.fingerprint())
            .await?
        {
            tracing::debug!(device_id = %existing.id, "registration matched existing fingerprint");
            return Ok(RegisterOutcome {
                device: existing,
                verification_code: None,
            });
        }

        if !identity.is_admin() {
            let current = self.devices.count_devices_for_owner(&identity.id).await?;
            let decision = check_device_limit(plan, current);
            if !decision.allowed {
                return Err(AppError::new(ErrorCode::DeviceLimitExceeded)
                    .with_detail("limit", plan.device_limit)
                    .with_detail("remaining", decision.remaining.unwrap_or(0)));
            }
        }

        let now = self.clock.now();
        let device = Device {
            id: Uuid::new_v4().to_string(),
            owner_id: identity.id.clone(),
            kind: info.kind,
            name: info.name.clone(),
            platform: info.platform.clone(),
            trust_state: if self.require_verification {
                TrustState::PendingVerification
            } else {
                TrustState::Verified
            },
            last_seen_at: now,
            last_seen_addr: addr,
            created_at: now,
        };
        self.devices.create_device(device.clone()).await?;

        let verification_code = self
            .require_verification
            .then(|| self.issue_code(&device.id));
        tracing::info!(device_id = %device.id, owner_id = %identity.id, "device registered");
        Ok(RegisterOutcome {
            device,
            verification_code,
        })
    }

    /// Confirm a verification code, advancing pending → verified
    ///
    /// Codes are single-use: both success and exhausting the attempt
    /// budget consume the code.
    pub async fn verify(&self, device_id: &str, code: &str) -> Result<Device, AppError> {
        let device = self.require_device(device_id).await?;
        match device.trust_state {
            TrustState::PendingVerification => {}
            TrustState::Verified | TrustState::Trusted => {
                return Err(AppError::new(ErrorCode::DeviceAlreadyVerified));
            }
            TrustState::Blocked => return Err(AppError::new(ErrorCode::DeviceBlocked)),
        }

        let now = self.clock.now();
        let outcome = match self.codes.get_mut(device_id) {
            None => CodeCheck::Missing,
            Some(mut pending) => {
                if now > pending.expires_at {
                    CodeCheck::Expired
                } else if pending.code == code {
                    CodeCheck::Match
                } else {
                    pending.attempts += 1;
                    if pending.attempts >= MAX_VERIFY_ATTEMPTS {
                        CodeCheck::Exhausted
                    } else {
                        CodeCheck::Mismatch
                    }
                }
            }
        };

        match outcome {
            CodeCheck::Match => {
                self.codes.remove(device_id);
                self.transition(&device, TrustState::Verified).await
            }
            CodeCheck::Expired => {
                self.codes.remove(device_id);
                Err(AppError::new(ErrorCode::VerificationCodeExpired))
            }
            CodeCheck::Exhausted => {
                self.codes.remove(device_id);
                tracing::warn!(device_id, "verification attempts exhausted");
                Err(AppError::new(ErrorCode::TooManyAttempts))
            }
            CodeCheck::Mismatch | CodeCheck::Missing => {
                Err(AppError::new(ErrorCode::VerificationCodeInvalid))
            }
        }
    }

    /// Issue a replacement code for a still-pending device
    pub async fn reissue_code(&self, device_id: &str) -> Result<String, AppError> {
        let device = self.require_device(device_id).await?;
        if device.trust_state != TrustState::PendingVerification {
            return Err(AppError::new(ErrorCode::DeviceAlreadyVerified));
        }
        Ok(self.issue_code(device_id))
    }

    /// Promote a verified device to trusted
    pub async fn trust(&self, device_id: &str) -> Result<Device, AppError> {
        let device = self.require_device(device_id).await?;
        self.transition(&device, TrustState::Trusted).await
    }

    /// Demote a trusted device back to verified
    pub async fn untrust(&self, device_id: &str) -> Result<Device, AppError> {
        let device = self.require_device(device_id).await?;
        self.transition(&device, TrustState::Verified).await
    }

    /// Block a device, freeing its quota slot
    pub async fn block(&self, device_id: &str) -> Result<Device, AppError> {
        let device = self.require_device(device_id).await?;
        if device.trust_state == TrustState::Blocked {
            return Ok(device);
        }
        self.transition(&device, TrustState::Blocked).await
    }

    /// Unblock a device; administrator action only
    ///
    /// The device re-enters at `Verified`, not at its pre-block state.
    pub async fn unblock(&self, actor: &Identity, device_id: &str) -> Result<Device, AppError> {
        if !actor.is_admin() {
            return Err(AppError::permission_denied("administrator role required"));
        }
        let device = self.require_device(device_id).await?;
        if device.trust_state != TrustState::Blocked {
            return Ok(device);
        }
        self.transition(&device, TrustState::Verified).await
    }

    /// Load a device and check it may be used by `identity`
    ///
    /// A device owned by someone else is reported as not found, never
    /// as belonging to another account.
    pub async fn resolve(&self, identity: &Identity, device_id: &str) -> Result<Device, AppError> {
        let device = self.require_device(device_id).await?;
        if device.owner_id != identity.id && !identity.is_admin() {
            return Err(AppError::new(ErrorCode::DeviceNotFound));
        }
        match device.trust_state {
            TrustState::Verified | TrustState::Trusted => Ok(device),
            TrustState::PendingVerification => Err(AppError::new(ErrorCode::DeviceNotVerified)),
            TrustState::Blocked => Err(AppError::new(ErrorCode::DeviceBlocked)),
        }
    }

    /// Record device activity
    pub async fn touch(&self, device_id: &str, addr: Option<String>) -> Result<(), AppError> {
        self.devices
            .update_last_seen(device_id, self.clock.now(), addr)
            .await?;
        Ok(())
    }

    /// Block least-recently-seen devices until the count fits the plan
    ///
    /// Runs after downgrades and after quota overshoot. `in_grace`
    /// callers (a plan change within the grace window) skip this and
    /// tolerate the excess instead.
    pub async fn enforce_device_limit(
        &self,
        identity: &Identity,
        plan: &Plan,
    ) -> Result<Vec<Device>, AppError> {
        if plan.unlimited_devices() {
            return Ok(Vec::new());
        }
        let limit = plan.device_limit.max(0) as usize;

        let mut usable: Vec<Device> = self
            .devices
            .list_devices_for_owner(&identity.id)
            .await?
            .into_iter()
            .filter(|d| d.trust_state != TrustState::Blocked)
            .collect();
        if usable.len() <= limit {
            return Ok(Vec::new());
        }

        // Oldest activity first, device id as the deterministic tiebreak
        usable.sort_by(|a, b| {
            a.last_seen_at
                .cmp(&b.last_seen_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let excess = usable.len() - limit;
        let mut blocked = Vec::with_capacity(excess);
        for device in usable.into_iter().take(excess) {
            self.devices
                .update_trust_state(&device.id, TrustState::Blocked)
                .await?;
            tracing::info!(device_id = %device.id, owner_id = %identity.id, "device blocked to enforce plan limit");
            blocked.push(device);
        }
        Ok(blocked)
    }

    async fn require_device(&self, device_id: &str) -> Result<Device, AppError> {
        self.devices
            .find_device_by_id(device_id)
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::DeviceNotFound))
    }

    async fn transition(&self, device: &Device, next: TrustState) -> Result<Device, AppError> {
        if !device.trust_state.can_transition_to(next) {
            tracing::warn!(
                device_id = %device.id,
                from = ?device.trust_state,
                to = ?next,
                "rejected trust transition"
            );
            return Err(AppError::invalid_request("invalid trust transition"));
        }
        self.devices.update_trust_state(&device.id, next).await?;
        let mut updated = device.clone();
        updated.trust_state = next;
        Ok(updated)
    }

    fn issue_code(&self, device_id: &str) -> String {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        self.codes.insert(
            device_id.to_owned(),
            PendingCode {
                code: code.clone(),
                expires_at: self.clock.now() + Duration::minutes(CODE_TTL_MINUTES),
                attempts: 0,
            },
        );
        code
    }
}

enum CodeCheck {
    Match,
    Mismatch,
    Missing,
    Expired,
    Exhausted,
}
