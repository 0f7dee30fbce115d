//! Typed failure taxonomy shared across every layer of the SDK.
//!
//! Each layer classifies and wraps at the point it has the context to do so
//! (HttpCore knows about statuses, AuthCore knows about OAuth error codes,
//! BaseConnector knows about token lifecycle) — never discard the cause.

use std::time::Duration;

/// Root error type returned by every public SDK operation.
///
/// `Clone` so a `futures::future::Shared` refresh future (single-flight
/// dedup in `connector.rs`) can hand the same outcome to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SdkError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("oauth error: {0}")]
    OAuth(String),

    #[error("oauth authorization denied: {0}")]
    OAuthDenied(String),

    #[error("no token stored for user={user_id} provider={provider}")]
    TokenNotFound { user_id: String, provider: String },

    #[error("token expired and refresh token invalid for user={user_id} provider={provider}; reconnection required")]
    TokenExpired { user_id: String, provider: String },

    #[error("token refresh failed for user={user_id} provider={provider}: {reason}")]
    TokenRefresh {
        user_id: String,
        provider: String,
        reason: String,
    },

    #[error("upstream client error ({status}): {message}")]
    ApiClient { status: u16, message: String },

    #[error("upstream server error ({status}): {message}")]
    ApiServer { status: u16, message: String },

    #[error("rate limited by upstream (retry_after={retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("circuit breaker open for provider={provider}")]
    CircuitBreakerOpen { provider: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("schema validation failed: {0}")]
    Schema(String),
}

impl SdkError {
    /// Whether a retry loop should attempt this error again: 5xx and 429
    /// are retryable, 4xx and everything else are not. Callers with a
    /// `retryableStatusCodes` set should prefer checking that set directly
    /// against `status_code()`; this is the generic fallback used when no
    /// explicit set is given.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SdkError::ApiServer { .. } | SdkError::RateLimit { .. } | SdkError::NetworkTimeout(_)
        )
    }

    /// HTTP status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SdkError::ApiClient { status, .. } => Some(*status),
            SdkError::ApiServer { status, .. } => Some(*status),
            SdkError::RateLimit { .. } => Some(429),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SdkError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type SdkResult<T> = Result<T, SdkError>;
