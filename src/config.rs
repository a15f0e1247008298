//! Gate configuration

use crate::auth::TokenConfig;
use crate::error::{AppError, ErrorCode};

/// Gate configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Token signing secret (env: GATE_TOKEN_SECRET)
    pub token_secret: String,
    /// Access-token lifetime in minutes (env: GATE_TOKEN_EXPIRATION_MINUTES)
    pub token_expiration_minutes: i64,
    /// Token issuer claim (env: GATE_TOKEN_ISSUER)
    pub token_issuer: String,
    /// Token audience claim (env: GATE_TOKEN_AUDIENCE)
    pub token_audience: String,
    /// Session idle TTL in minutes (env: GATE_SESSION_IDLE_MINUTES)
    pub session_idle_minutes: i64,
    /// Device-limit grace window after a plan change, in hours
    /// (env: GATE_DOWNGRADE_GRACE_HOURS)
    pub downgrade_grace_hours: i64,
    /// Whether new devices must pass code verification
    /// (env: GATE_REQUIRE_DEVICE_VERIFICATION)
    pub require_device_verification: bool,
    /// Environment: development | staging | production
    pub environment: String,
}

impl GateConfig {
    /// Require a secret env var: must be set and non-empty outside development
    fn require_secret(name: &str, environment: &str) -> Result<String, AppError> {
        let val = match std::env::var(name) {
            Ok(v) => v,
            Err(_) => {
                if environment != "development" {
                    return Err(AppError::with_message(
                        ErrorCode::ConfigError,
                        format!("{name} must be set in {environment} environment"),
                    ));
                }
                format!("dev-{name}-not-for-production-0123456789")
            }
        };
        if val.is_empty() && environment != "development" {
            return Err(AppError::with_message(
                ErrorCode::ConfigError,
                format!("{name} must not be empty in {environment} environment"),
            ));
        }
        Ok(val)
    }

    /// Load configuration from environment variables (reads `.env` first)
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into());

        Ok(Self {
            token_secret: Self::require_secret("GATE_TOKEN_SECRET", &environment)?,
            token_expiration_minutes: std::env::var("GATE_TOKEN_EXPIRATION_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1440),
            token_issuer: std::env::var("GATE_TOKEN_ISSUER")
                .unwrap_or_else(|_| "stream-gate".into()),
            token_audience: std::env::var("GATE_TOKEN_AUDIENCE")
                .unwrap_or_else(|_| "stream-clients".into()),
            session_idle_minutes: std::env::var("GATE_SESSION_IDLE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            downgrade_grace_hours: std::env::var("GATE_DOWNGRADE_GRACE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
            require_device_verification: std::env::var("GATE_REQUIRE_DEVICE_VERIFICATION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            environment,
        })
    }

    /// Token service configuration derived from this config
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            secret: self.token_secret.clone(),
            expiration_minutes: self.token_expiration_minutes,
            issuer: self.token_issuer.clone(),
            audience: self.token_audience.clone(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            token_secret: "dev-GATE_TOKEN_SECRET-not-for-production-0123456789".into(),
            token_expiration_minutes: 1440,
            token_issuer: "stream-gate".into(),
            token_audience: "stream-clients".into(),
            session_idle_minutes: 30,
            downgrade_grace_hours: 24,
            require_device_verification: true,
            environment: "development".into(),
        }
    }
}
