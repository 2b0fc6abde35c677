//! Error types for gitian-sandbox.

use thiserror::Error;

/// Result type alias for gitian-sandbox operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while talking to a sandbox backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not allocate a sandbox right now (daemon down,
    /// resources exhausted). Callers may retry.
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),

    /// The base image for a sandbox does not exist
    #[error("base image not found: {0}")]
    ImageMissing(String),

    /// Building a base image failed
    #[error("failed to build image {image}: {message}")]
    ImageBuild { image: String, message: String },

    /// A backend tool exited unsuccessfully
    #[error("{program} exited with code {code}: {stderr}")]
    Command {
        /// Program that was invoked (e.g. `docker`)
        program: String,
        /// Exit code, -1 when killed by a signal
        code: i32,
        /// Captured standard error, trimmed
        stderr: String,
    },

    /// The requested path does not exist inside the sandbox
    #[error("path not found in sandbox: {0}")]
    PathNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the failure is transient and worth one more attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
