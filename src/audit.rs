//! Audit trail for gate decisions
//!
//! The wire response for an authentication failure is deliberately
//! opaque; the audit record keeps the real reason. Hosts that ship
//! audit events elsewhere implement [`AuditSink`]; the default sink
//! writes structured log lines.

use crate::auth::RateClass;
use crate::error::ErrorCode;

/// One auditable gate decision
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// Authentication rejected; `reason` is the internal failure kind
    /// never surfaced to the client
    AuthRejected {
        reason: &'static str,
        addr: Option<String>,
    },
    /// A request was denied by a post-auth stage
    AccessDenied {
        identity_id: String,
        device_id: Option<String>,
        code: ErrorCode,
    },
    /// A rate window rejected a request
    RateLimited {
        class: RateClass,
        key: String,
        retry_after_seconds: u64,
    },
    /// A device changed trust state outside the normal verify flow
    DeviceBlocked {
        identity_id: String,
        device_id: String,
        enforced: bool,
    },
    /// A request passed every stage
    Allowed {
        identity_id: String,
        device_id: Option<String>,
    },
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default sink: structured log lines via `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event {
            AuditEvent::AuthRejected { reason, addr } => {
                tracing::warn!(target: "gate_audit", reason, addr, "auth rejected");
            }
            AuditEvent::AccessDenied {
                identity_id,
                device_id,
                code,
            } => {
                tracing::warn!(
                    target: "gate_audit",
                    identity_id,
                    device_id,
                    code = code.label(),
                    "access denied"
                );
            }
            AuditEvent::RateLimited {
                class,
                key,
                retry_after_seconds,
            } => {
                tracing::warn!(
                    target: "gate_audit",
                    class = class.as_str(),
                    key,
                    retry_after_seconds,
                    "rate limited"
                );
            }
            AuditEvent::DeviceBlocked {
                identity_id,
                device_id,
                enforced,
            } => {
                tracing::warn!(
                    target: "gate_audit",
                    identity_id,
                    device_id,
                    enforced,
                    "device blocked"
                );
            }
            AuditEvent::Allowed {
                identity_id,
                device_id,
            } => {
                tracing::debug!(target: "gate_audit", identity_id, device_id, "request allowed");
            }
        }
    }
}
