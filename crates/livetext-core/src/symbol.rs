//! Symbols: the atomic units of a document

use serde::{Deserialize, Serialize};

use crate::block::TextBlockId;
use crate::format::CharFormat;
use crate::position::{Position, SiteId};

/// Author of a symbol, block or list; doubles as the allocating site
pub type AuthorId = SiteId;

/// Character that terminates a paragraph
pub const PARAGRAPH_SEPARATOR: char = '\u{2029}';

/// One rich-text character tagged with its position and author
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub ch: char,
    pub format: CharFormat,
    pub author: AuthorId,
    pub position: Position,
    pub block: TextBlockId,
}

impl Symbol {
    pub fn new(
        ch: char,
        format: CharFormat,
        author: AuthorId,
        position: Position,
        block: TextBlockId,
    ) -> Self {
        Self {
            ch,
            format,
            author,
            position,
            block,
        }
    }

    pub fn is_paragraph_separator(&self) -> bool {
        self.ch == PARAGRAPH_SEPARATOR
    }
}
