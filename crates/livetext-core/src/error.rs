//! Error types for LiveText Core

use thiserror::Error;

use crate::block::{TextBlockId, TextListId};
use crate::position::Position;

/// Core error types
///
/// Every variant describes an edit that cannot be applied to the current document state.
/// Callers on the server treat them as no-ops: they are logged and the session continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Unknown block: {0}")]
    UnknownBlock(TextBlockId),

    #[error("Unknown list: {0}")]
    UnknownList(TextListId),

    #[error("Index {index} out of bounds for document of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Position already in use: {0}")]
    DuplicatePosition(Position),

    #[error("Cannot allocate between {before} and {after}")]
    InvalidBounds { before: Position, after: Position },

    #[error("Invalid document URI: {0}")]
    InvalidUri(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to restore state: {0}")]
    RestoreError(String),
}

/// Result type alias for LiveText Core operations
pub type Result<T> = std::result::Result<T, Error>;
