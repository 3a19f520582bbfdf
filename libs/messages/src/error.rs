//! Error types for message handling.

use thiserror::Error;

/// Errors that can occur when decoding or encoding bus messages.
#[derive(Debug, Error, Clone)]
pub enum MessageError {
    /// The payload is not a valid message of the expected type.
    #[error("invalid message payload: {0}")]
    InvalidPayload(String),

    /// A required field is missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A numeric field is outside the accepted range.
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Serialization(err.to_string())
    }
}
