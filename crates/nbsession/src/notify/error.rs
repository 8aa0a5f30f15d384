//! Notification error types.

use thiserror::Error;

/// Result type for notification operations.
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Errors that can occur while delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The remote service answered with a non-success status.
    #[error("{service} rejected the request ({status}): {message}")]
    Rejected {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}
