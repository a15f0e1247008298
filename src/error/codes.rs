//! Unified error codes for the gate pipeline
//!
//! Error codes are organized by category:
//! - 0xxx: General errors
//! - 1xxx: Authentication errors
//! - 2xxx: Device errors
//! - 3xxx: Entitlement errors
//! - 4xxx: Rate-limit errors
//! - 9xxx: System errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error code enum
///
/// Codes are represented as u16 values for efficient serialization and
/// cross-language compatibility. Each code also carries a stable
/// SCREAMING_SNAKE [`label`](ErrorCode::label) that clients may match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 0xxx: General ====================
    /// Operation completed successfully
    Success = 0,
    /// Unknown error
    Unknown = 1,
    /// Resource not found
    NotFound = 3,
    /// Invalid request
    InvalidRequest = 5,

    // ==================== 1xxx: Auth ====================
    /// Request carries no valid credential
    NotAuthenticated = 1001,
    /// Invalid credentials presented to a login flow
    InvalidCredentials = 1002,
    /// Caller lacks the role required for the operation
    PermissionDenied = 1005,

    // ==================== 2xxx: Device ====================
    /// Device is unregistered or pending verification
    DeviceNotVerified = 2001,
    /// Device has been blocked
    DeviceBlocked = 2002,
    /// Device record not found
    DeviceNotFound = 2003,
    /// Verification code does not match
    VerificationCodeInvalid = 2004,
    /// Verification code has expired or none is outstanding
    VerificationCodeExpired = 2005,
    /// Verification attempts exhausted, request a fresh code
    TooManyAttempts = 2006,
    /// Device is already verified
    DeviceAlreadyVerified = 2007,
    /// Plan does not permit this device type
    DeviceKindNotAllowed = 2008,

    // ==================== 3xxx: Entitlement ====================
    /// No active subscription
    SubscriptionRequired = 3001,
    /// Plan device limit reached
    DeviceLimitExceeded = 3002,
    /// Plan concurrent-stream limit reached
    SessionLimitExceeded = 3003,
    /// Feature not available in the current plan
    FeatureNotAvailable = 3004,

    // ==================== 4xxx: Rate limit ====================
    /// Too many requests in the current window
    RateLimitExceeded = 4001,

    // ==================== 9xxx: System ====================
    /// Internal server error
    InternalError = 9001,
    /// Backing store unreachable or inconsistent
    StoreUnavailable = 9002,
    /// Service is in maintenance mode
    Maintenance = 9003,
    /// Configuration error
    ConfigError = 9004,
}

impl ErrorCode {
    /// Get the numeric code value
    #[inline]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if this is a success code
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Stable machine-readable label surfaced to clients
    pub const fn label(&self) -> &'static str {
        match self {
            ErrorCode::Success => "OK",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",

            ErrorCode::NotAuthenticated => "UNAUTHORIZED",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",

            ErrorCode::DeviceNotVerified => "DEVICE_NOT_VERIFIED",
            ErrorCode::DeviceBlocked => "DEVICE_BLOCKED",
            ErrorCode::DeviceNotFound => "DEVICE_NOT_FOUND",
            ErrorCode::VerificationCodeInvalid => "VERIFICATION_CODE_INVALID",
            ErrorCode::VerificationCodeExpired => "VERIFICATION_CODE_EXPIRED",
            ErrorCode::TooManyAttempts => "TOO_MANY_ATTEMPTS",
            ErrorCode::DeviceAlreadyVerified => "DEVICE_ALREADY_VERIFIED",
            ErrorCode::DeviceKindNotAllowed => "DEVICE_KIND_NOT_ALLOWED",

            ErrorCode::SubscriptionRequired => "SUBSCRIPTION_REQUIRED",
            ErrorCode::DeviceLimitExceeded => "DEVICE_LIMIT_EXCEEDED",
            ErrorCode::SessionLimitExceeded => "SESSION_LIMIT_EXCEEDED",
            ErrorCode::FeatureNotAvailable => "FEATURE_NOT_AVAILABLE",

            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",

            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::StoreUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Maintenance => "MAINTENANCE",
            ErrorCode::ConfigError => "CONFIG_ERROR",
        }
    }

    /// Get the developer-facing English message for this error code
    pub const fn message(&self) -> &'static str {
        match self {
            ErrorCode::Success => "Operation completed successfully",
            ErrorCode::Unknown => "An unknown error occurred",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::InvalidRequest => "Invalid request",

            ErrorCode::NotAuthenticated => "Authentication required",
            ErrorCode::InvalidCredentials => "Invalid credentials",
            ErrorCode::PermissionDenied => "Permission denied",

            ErrorCode::DeviceNotVerified => "Device must be verified before use",
            ErrorCode::DeviceBlocked => "Device has been blocked",
            ErrorCode::DeviceNotFound => "Device not found",
            ErrorCode::VerificationCodeInvalid => "Invalid verification code",
            ErrorCode::VerificationCodeExpired => "Verification code has expired",
            ErrorCode::TooManyAttempts => "Too many verification attempts",
            ErrorCode::DeviceAlreadyVerified => "Device is already verified",
            ErrorCode::DeviceKindNotAllowed => "Plan does not allow this device type",

            ErrorCode::SubscriptionRequired => "An active subscription is required",
            ErrorCode::DeviceLimitExceeded => "Device limit reached for this plan",
            ErrorCode::SessionLimitExceeded => "Concurrent stream limit reached for this plan",
            ErrorCode::FeatureNotAvailable => "Feature not available in current plan",

            ErrorCode::RateLimitExceeded => "Too many requests, try again later",

            ErrorCode::InternalError => "Internal server error",
            ErrorCode::StoreUnavailable => "Service temporarily unavailable",
            ErrorCode::Maintenance => "Service is under maintenance",
            ErrorCode::ConfigError => "Configuration error",
        }
    }
}

impl From<ErrorCode> for u16 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error when converting from an invalid u16 to ErrorCode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidErrorCode(pub u16);

impl fmt::Display for InvalidErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {}", self.0)
    }
}

impl std::error::Error for InvalidErrorCode {}

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Success),
            1 => Ok(ErrorCode::Unknown),
            3 => Ok(ErrorCode::NotFound),
            5 => Ok(ErrorCode::InvalidRequest),

            1001 => Ok(ErrorCode::NotAuthenticated),
            1002 => Ok(ErrorCode::InvalidCredentials),
            1005 => Ok(ErrorCode::PermissionDenied),

            2001 => Ok(ErrorCode::DeviceNotVerified),
            2002 => Ok(ErrorCode::DeviceBlocked),
            2003 => Ok(ErrorCode::DeviceNotFound),
            2004 => Ok(ErrorCode::VerificationCodeInvalid),
            2005 => Ok(ErrorCode::VerificationCodeExpired),
            2006 => Ok(ErrorCode::TooManyAttempts),
            2007 => Ok(ErrorCode::DeviceAlreadyVerified),
            2008 => Ok(ErrorCode::DeviceKindNotAllowed),

            3001 => Ok(ErrorCode::SubscriptionRequired),
            3002 => Ok(ErrorCode::DeviceLimitExceeded),
            3003 => Ok(ErrorCode::SessionLimitExceeded),
            3004 => Ok(ErrorCode::FeatureNotAvailable),

            4001 => Ok(ErrorCode::RateLimitExceeded),

            9001 => Ok(ErrorCode::InternalError),
            9002 => Ok(ErrorCode::StoreUnavailable),
            9003 => Ok(ErrorCode::Maintenance),
            9004 => Ok(ErrorCode::ConfigError),

            _ => Err(InvalidErrorCode(value)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
