//! Error types for the protocol crate.

use thiserror::Error;

/// Wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the message size budget.
    #[error("message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Header is not valid JSON or has the wrong field shape.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Header type tag is not part of the protocol. Receivers log and
    /// skip these.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Header type is valid but not allowed at this point, such as a
    /// second `start` or a `resize` before `start`. Fatal to the
    /// transport.
    #[error("unexpected message type: {0}")]
    UnexpectedType(String),

    /// Failed to serialize a header.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            ProtocolError::Serialization(err.to_string())
        } else {
            ProtocolError::MalformedHeader(err.to_string())
        }
    }
}
