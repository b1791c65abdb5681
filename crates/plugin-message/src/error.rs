//! Codec error types.

use thiserror::Error;

/// Errors produced while generating or parsing message text.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The text is not a well-formed message.
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),

    /// The frame payload is not valid UTF-8.
    #[error("Invalid UTF-8 in message text: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The message could not be serialized.
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Result type alias using MessageError.
pub type MessageResult<T> = Result<T, MessageError>;
