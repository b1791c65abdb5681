//! Error types for plugin loading.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or talking to a backend module.
#[derive(Error, Debug)]
pub enum PluginLoadError {
    /// The module is missing or cannot be loaded on this platform
    #[error("Failed to load plugin {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// The module does not export the expected entry point
    #[error("Plugin entry point {symbol} unavailable: {reason}")]
    EntryPoint { symbol: String, reason: String },

    /// The backend's init returned a nonzero status
    #[error("Plugin init failed with code {0}")]
    InitFailed(i32),

    /// A message could not be passed across the C boundary
    #[error("Invalid plugin message: {0}")]
    InvalidMessage(String),
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginLoadError>;
