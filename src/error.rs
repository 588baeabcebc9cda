//! Error types shared by the transport, the multiplexer and the polling workers.

use thiserror::Error;

/// Errors produced by the live-update client.
///
/// The type is `Clone` so a fatal transport error can be handed to every
/// consumer of a shared connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LiveError {
    /// Server rejected the credential (HTTP 401)
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Server refused access to the resource (HTTP 403)
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource does not exist on an auth-scoped endpoint (HTTP 404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Server answered with a status the endpoint class does not retry
    #[error("unexpected HTTP status {status}: {url}")]
    Status { status: u16, url: String },

    /// Connection refused, reset or dropped
    #[error("network error: {0}")]
    Network(String),

    /// Connect or request deadline elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// Frame or body could not be decoded
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Filter is missing a key its type requires
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Configured retry budget was used up
    #[error("gave up after {0} attempts")]
    RetryBudgetExhausted(u32),

    /// Client or worker has been closed
    #[error("closed")]
    Closed,

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),
}

impl LiveError {
    /// Fatal errors stop the affected worker or connection and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LiveError::Unauthorized(_)
                | LiveError::Forbidden(_)
                | LiveError::NotFound(_)
                | LiveError::Status { .. }
                | LiveError::RetryBudgetExhausted(_)
                | LiveError::Closed
                | LiveError::Config(_)
                | LiveError::InvalidFilter(_)
        )
    }

    /// Transient errors are retried with backoff by the worker that saw them.
    pub fn is_transient(&self) -> bool {
        matches!(self, LiveError::Network(_) | LiveError::Timeout(_))
    }
}

impl From<reqwest::Error> for LiveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LiveError::Timeout(e.to_string())
        } else if e.is_decode() {
            LiveError::Malformed(e.to_string())
        } else {
            LiveError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(e: serde_json::Error) -> Self {
        LiveError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
