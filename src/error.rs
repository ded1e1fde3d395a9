//! Error taxonomy for the index and sync engine.
//!
//! Every variant is cheap to clone so a single refresh result can be shared
//! with all callers waiting on the same in-flight request.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Transient transport failure (5xx, timeout, connection reset).
    #[error("network error: {0}")]
    Network(String),

    /// Credentials missing or refused. Never retried here.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The content validator refused the payload.
    #[error("content rejected: {0}")]
    ContentRejected(String),

    /// Both sides changed; nothing was written.
    #[error("conflict requires manual resolution: {0}")]
    ConflictUnresolved(String),

    /// The remote refused a write because its copy moved underneath us (HTTP 409).
    #[error("remote conflict: {0}")]
    Conflict(String),

    /// A cached or fetched snapshot could not be decoded.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    #[error("circuit open for {source_name}, next trial in {retry_in:?}")]
    CircuitOpen {
        source_name: String,
        retry_in: Duration,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Transient errors are worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_) | EngineError::RateLimited { .. }
        )
    }

    /// The wait advertised by the source, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP status into the taxonomy.
    pub fn from_status(status: u16, retry_after: Option<Duration>, context: &str) -> Self {
        match status {
            401 | 403 if retry_after.is_none() => {
                EngineError::Auth(format!("HTTP {} ({})", status, context))
            }
            403 | 429 => EngineError::RateLimited { retry_after },
            404 => EngineError::NotFound(context.to_string()),
            409 => EngineError::Conflict(context.to_string()),
            s if s >= 500 => EngineError::Network(format!("HTTP {} ({})", s, context)),
            s => EngineError::Io(format!("unexpected HTTP {} ({})", s, context)),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => EngineError::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => EngineError::Network(err.to_string()),
            _ => EngineError::Io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for EngineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        EngineError::DeadlineExceeded
    }
}
