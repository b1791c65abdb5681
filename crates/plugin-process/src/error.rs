//! Error types for plugin process management.

use plugin_shm::ShmError;
use thiserror::Error;

/// Errors raised by the host or child process managers.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Shared memory failure
    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),

    /// The child process could not be started
    #[error("Launch failed: {0}")]
    Launch(String),
}

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;
