//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors. Any of them ends the session that caused it.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message tag: {0:#06x}")]
    UnknownTag(u16),

    #[error("Malformed {name} payload: {reason}")]
    Malformed { name: &'static str, reason: String },

    #[error("Failed to encode {name}: {reason}")]
    Encode { name: &'static str, reason: String },

    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
