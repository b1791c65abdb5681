//! Error types for the message pipe.

use thiserror::Error;

/// Message pipe error type.
#[derive(Error, Debug)]
pub enum PipeError {
    /// IO error on the underlying socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection or an earlier error broke the pipe
    #[error("Pipe is broken")]
    Broken,

    /// A frame header declared more bytes than the pipe accepts
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// A message could not be serialized
    #[error("Encode error: {0}")]
    Encode(#[from] plugin_message::MessageError),
}

/// Result type for pipe operations.
pub type PipeResult<T> = Result<T, PipeError>;
