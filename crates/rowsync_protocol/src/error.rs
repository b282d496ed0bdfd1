//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A length prefix exceeds the allowed maximum.
    #[error("length {length} exceeds maximum of {max}")]
    LengthOverflow {
        /// The declared length.
        length: u64,
        /// The allowed maximum.
        max: u64,
    },

    /// Invalid UTF-8 in a string field.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A frame body did not match any known message type.
    #[error("unknown message type: {name}")]
    UnknownMessage {
        /// The type name found in the frame.
        name: String,
    },

    /// Structurally invalid data.
    #[error("invalid {what}: {message}")]
    Invalid {
        /// What was being decoded.
        what: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// A timestamp string could not be parsed.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Trailing bytes after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

impl ProtocolError {
    /// Creates an invalid-data error.
    pub fn invalid(what: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            what,
            message: message.into(),
        }
    }
}
