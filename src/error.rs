//! Common error types for copyvet

use thiserror::Error;

/// Common result type for copyvet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds shared across the service.
///
/// Transient service responses (429/500) are retried inside the HTTP
/// clients and never surface here; a `Service` error is a final,
/// non-retryable answer from the remote side.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP transport error (wraps reqwest::Error)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Non-retryable error response from a remote service
    #[error("service error {status}: {body}")]
    Service { status: u16, body: String },

    /// Response that could not be interpreted
    #[error("malformed response: {0}")]
    Protocol(String),

    /// Page title that cannot be resolved
    #[error("invalid title: {0}")]
    InvalidTitle(String),
}

impl Error {
    /// True when the error is a unique-constraint violation, i.e. another
    /// invocation already inserted the same row.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }
}
