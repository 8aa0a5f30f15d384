//! Session controller error types.

use std::time::Duration;

use thiserror::Error;

use crate::container::ContainerError;
use crate::workspace::WorkspaceError;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the session controller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The user id cannot be turned into a container name or workspace path.
    #[error("Invalid user id: '{0}'")]
    InvalidUserId(String),

    /// No container exists under the given name.
    #[error("No such session: {0}")]
    NotFound(String),

    /// The container did not reach the running state in time.
    #[error("Session {name} not running after {timeout:?} (state: {state})")]
    NotReady {
        name: String,
        timeout: Duration,
        state: String,
    },

    /// The container exposes no host port for the notebook port.
    #[error("Session {name} has no host port for {port}")]
    NoHostPort { name: String, port: String },

    /// The container runtime failed.
    #[error("Container runtime error: {0}")]
    Runtime(#[from] ContainerError),
}

impl From<WorkspaceError> for SessionError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::InvalidUserId(user_id) => SessionError::InvalidUserId(user_id),
        }
    }
}
