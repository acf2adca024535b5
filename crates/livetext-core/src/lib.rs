//! LiveText Core - Conflict-free rich-text document model
//!
//! This crate provides the core functionality for LiveText:
//! - Dense position allocation for concurrent sequence edits
//! - Documents of formatted symbols grouped into blocks and lists
//! - Snapshots for persistence and for joining editors
//! - Document and user identity

pub mod block;
pub mod document;
pub mod error;
pub mod format;
pub mod position;
pub mod symbol;
pub mod user;

pub use block::{ListChange, TextBlock, TextBlockId, TextList, TextListId};
pub use document::{Document, DocumentMeta, DocumentSnapshot, DocumentUri};
pub use error::{Error, Result};
pub use format::{
    Alignment, BlockFormat, CharFormat, Color, LineHeight, LineHeightKind, ListFormat, ListStyle,
};
pub use position::{Clock, Identifier, Position, SiteId};
pub use symbol::{AuthorId, Symbol, PARAGRAPH_SEPARATOR};
pub use user::{validate_username, User, UserId};
