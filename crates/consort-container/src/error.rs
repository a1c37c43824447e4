//! Container runtime error types.

use thiserror::Error;

/// Errors that can occur while driving a computation container.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Failed to reach the container runtime
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Runtime is not usable (missing daemon, bad configuration)
    #[error("Runtime not available: {0}")]
    NotAvailable(String),

    /// Failed to create the container
    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    /// Failed to start the container
    #[error("Failed to start container: {0}")]
    StartFailed(String),

    /// The combined output stream was malformed
    #[error("Invalid stream frame: {0}")]
    InvalidFrame(String),

    /// Execution failed after the container started
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to stop or remove the container
    #[error("Failed to stop container: {0}")]
    StopFailed(String),
}
