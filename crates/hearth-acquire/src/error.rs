//! Error taxonomy shared by the gateway and the orchestrator.

use std::sync::Arc;
use std::time::Duration;

/// Errors that can occur while acquiring external data.
///
/// The type is `Clone` so a single in-flight result can be handed to every
/// caller that joined it.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AcquireError {
    #[error("Challenge not cleared within {0:?}")]
    ChallengeTimeout(Duration),

    #[error("Browser unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("Upstream rejected the request with status {status}")]
    UpstreamRejected { status: u16 },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Not found")]
    NotFound,

    #[error("Transient failure: {0}")]
    TransientFailure(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for AcquireError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for AcquireError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            Self::UpstreamUnavailable(e.to_string())
        } else {
            Self::TransientFailure(e.to_string())
        }
    }
}

impl AcquireError {
    /// Whether the retry policy may attempt the operation again.
    ///
    /// 404 is permanent and 401/403 point at a broken identity, so neither is
    /// retried. Browser and challenge failures are left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_) | Self::RateLimited { .. } | Self::TransientFailure(_)
        )
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
///
/// Returns `None` for 2xx.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> Option<AcquireError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(AcquireError::UpstreamRejected { status }),
        404 | 410 => Some(AcquireError::NotFound),
        429 => Some(AcquireError::RateLimited { retry_after }),
        500..=599 => Some(AcquireError::UpstreamUnavailable(format!("status {status}"))),
        other => Some(AcquireError::TransientFailure(format!("status {other}"))),
    }
}

/// Convenience result type.
pub type AcquireResult<T> = Result<T, AcquireError>;
