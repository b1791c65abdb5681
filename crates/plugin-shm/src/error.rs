//! Error types for plugin-shm.

use thiserror::Error;

/// Errors that can occur while managing shared-memory regions.
#[derive(Error, Debug)]
pub enum ShmError {
    /// Failed to create a new region
    #[error("shared memory allocation failed: {0}")]
    Allocation(String),

    /// No region exists under the requested name
    #[error("shared memory segment not found: {0}")]
    NotFound(String),

    /// Failed to map or unmap the region
    #[error("memory mapping error: {0}")]
    Mmap(String),

    /// Operation reserved for the other side of the handshake
    #[error("{operation} is not allowed on a region held as {role}")]
    WrongRole {
        operation: &'static str,
        role: &'static str,
    },

    /// Access outside the mapped range
    #[error("access of {len} bytes at offset {offset} exceeds region size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Name cannot be used for an OS shared-memory object
    #[error("invalid shared memory name: {0}")]
    InvalidName(String),

    /// Platform-specific error
    #[error("platform error: {0}")]
    Platform(String),
}

/// Result type for shared-memory operations.
pub type ShmResult<T> = Result<T, ShmError>;
