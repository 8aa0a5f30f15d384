//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A container with the requested name already exists.
    #[error("container name already in use: {0}")]
    NameConflict(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether this error means the named container does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::ContainerNotFound(_))
    }

    /// Classify the stderr of a failed runtime command.
    ///
    /// Docker and Podman both report missing objects and name collisions with
    /// stable phrases, which is the only signal the CLI gives us.
    pub(crate) fn from_stderr(command: &str, target: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("no such container") || lower.contains("no such object") {
            ContainerError::ContainerNotFound(target.to_string())
        } else if lower.contains("already in use") {
            ContainerError::NameConflict(target.to_string())
        } else {
            ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            }
        }
    }
}
