//! HTTP status code mapping for error codes

use super::codes::ErrorCode;
use http::StatusCode;

impl ErrorCode {
    /// Get the appropriate HTTP status code for this error code
    pub fn http_status(&self) -> StatusCode {
        match self {
            // Success
            Self::Success => StatusCode::OK,

            // 404 Not Found
            Self::NotFound | Self::DeviceNotFound => StatusCode::NOT_FOUND,

            // 401 Unauthorized
            Self::NotAuthenticated | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            Self::PermissionDenied
            | Self::DeviceNotVerified
            | Self::DeviceBlocked
            | Self::DeviceKindNotAllowed
            | Self::DeviceLimitExceeded
            | Self::SessionLimitExceeded
            | Self::FeatureNotAvailable => StatusCode::FORBIDDEN,

            // 402 Payment Required
            Self::SubscriptionRequired => StatusCode::PAYMENT_REQUIRED,

            // 409 Conflict
            Self::DeviceAlreadyVerified => StatusCode::CONFLICT,

            // 429 Too Many Requests
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,

            // 503 Service Unavailable (transient, client can retry)
            Self::StoreUnavailable | Self::Maintenance => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            Self::InternalError | Self::ConfigError => StatusCode::INTERNAL_SERVER_ERROR,

            // 400 Bad Request (default for validation errors)
            _ => StatusCode::BAD_REQUEST,
        }
    }
}
