//! Bearer-token authentication
//!
//! Validates signed tokens and resolves the owning identity. A token
//! that verifies cryptographically is still rejected when the account
//! behind it no longer exists or has been deactivated.

use chrono::Duration;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::clock::Clock;
use crate::error::{AppError, ErrorCode};
use crate::model::Identity;
use crate::store::UserStore;

/// Token service configuration
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Signing secret (at least 32 bytes)
    pub secret: String,
    pub expiration_minutes: i64,
    pub issuer: String,
    pub audience: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "development-only-signing-key-32-bytes!!".to_string(),
            expiration_minutes: 1440,
            issuer: "stream-gate".to_string(),
            audience: "stream-clients".to_string(),
        }
    }
}

/// Claims carried in an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Identity id (subject)
    pub sub: String,
    pub token_type: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub aud: String,
}

/// Authentication failure
///
/// Every variant maps to the same opaque wire response; the variant
/// only drives the audit record.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingToken,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token expired")]
    Expired,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("unknown subject")]
    UnknownSubject,

    #[error("account inactive")]
    Inactive,
}

impl AuthError {
    /// Short reason string for audit records
    pub fn audit_kind(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::Malformed(_) => "malformed",
            AuthError::Expired => "expired",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::UnknownSubject => "unknown_subject",
            AuthError::Inactive => "inactive",
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        // One opaque response for every failure mode: the caller must
        // not learn whether the token was expired, forged, or orphaned.
        tracing::debug!(reason = err.audit_kind(), "authentication rejected");
        AppError::new(ErrorCode::NotAuthenticated)
    }
}

/// Validates bearer tokens and resolves identities
pub struct TokenAuthenticator {
    config: TokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    users: Arc<dyn UserStore>,
    clock: Arc<dyn Clock>,
}

impl TokenAuthenticator {
    pub fn new(config: TokenConfig, users: Arc<dyn UserStore>, clock: Arc<dyn Clock>) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
            users,
            clock,
        }
    }

    /// Issue a signed access token for an identity
    pub fn issue_token(&self, identity_id: &str) -> Result<String, AppError> {
        let now = self.clock.now();
        let expiration = now + Duration::minutes(self.config.expiration_minutes);

        let claims = Claims {
            sub: identity_id.to_string(),
            token_type: "access".to_string(),
            exp: expiration.timestamp(),
            iat: now.timestamp(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "token generation failed");
            AppError::new(ErrorCode::InternalError)
        })
    }

    /// Decode and verify a raw token string
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.config.audience]);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_required_spec_claims(&["sub", "exp", "iat", "iss", "aud"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;
        Ok(data.claims)
    }

    /// Full authentication: verify the token, then load the identity
    ///
    /// The identity is loaded fresh on every call so that a deactivated
    /// account loses access immediately, regardless of token expiry.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AppError> {
        match self.try_authenticate(token).await {
            Ok(identity) => Ok(identity),
            Err(TryAuthError::Auth(e)) => Err(e.into()),
            Err(TryAuthError::Store(e)) => Err(e),
        }
    }

    /// Like [`authenticate`](Self::authenticate) but keeps the failure
    /// reason, for callers that audit rejections.
    pub async fn authenticate_audited(
        &self,
        token: Option<&str>,
    ) -> Result<Identity, (AppError, Option<&'static str>)> {
        match self.try_authenticate(token).await {
            Ok(identity) => Ok(identity),
            Err(TryAuthError::Auth(e)) => {
                let kind = e.audit_kind();
                Err((e.into(), Some(kind)))
            }
            Err(TryAuthError::Store(e)) => Err((e, None)),
        }
    }

    async fn try_authenticate(&self, token: Option<&str>) -> Result<Identity, TryAuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let claims = self.verify(token)?;

        let identity = self
            .users
            .find_user_by_id(&claims.sub)
            .await
            .map_err(AppError::from)?
            .ok_or(AuthError::UnknownSubject)?;

        if !identity.active {
            return Err(AuthError::Inactive.into());
        }
        Ok(identity)
    }

    /// Extract the token from an `Authorization` header value
    pub fn bearer_from_header(header: &str) -> Option<&str> {
        header.strip_prefix("Bearer ")
    }
}

enum TryAuthError {
    Auth(AuthError),
    Store(AppError),
}

impl From<AuthError> for TryAuthError {
    fn from(e: AuthError) -> Self {
        TryAuthError::Auth(e)
    }
}

impl From<AppError> for TryAuthError {
    fn from(e: AppError) -> Self {
        TryAuthError::Store(e)
    }
}
