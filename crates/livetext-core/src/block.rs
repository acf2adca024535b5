//! Paragraph blocks and lists

use serde::{Deserialize, Serialize};

use crate::format::{BlockFormat, ListFormat};
use crate::symbol::AuthorId;

/// Block identifier, unique per `(counter, author)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TextBlockId {
    pub counter: u32,
    pub author: AuthorId,
}

impl TextBlockId {
    pub fn new(counter: u32, author: AuthorId) -> Self {
        Self { counter, author }
    }
}

impl std::fmt::Display for TextBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block:{}@{}", self.counter, self.author)
    }
}

/// List identifier, unique per `(counter, author)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TextListId {
    pub counter: u32,
    pub author: AuthorId,
}

impl TextListId {
    pub fn new(counter: u32, author: AuthorId) -> Self {
        Self { counter, author }
    }
}

impl std::fmt::Display for TextListId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "list:{}@{}", self.counter, self.author)
    }
}

/// Paragraph formatting scope over the symbols tagged with its id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBlock {
    pub id: TextBlockId,
    pub format: BlockFormat,
    pub list: Option<TextListId>,
    /// Symbols currently tagged with this block; rebuilt on restore
    #[serde(skip)]
    pub(crate) symbols: usize,
}

impl TextBlock {
    pub fn new(id: TextBlockId, format: BlockFormat) -> Self {
        Self {
            id,
            format,
            list: None,
            symbols: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.symbols
    }

    pub fn is_empty(&self) -> bool {
        self.symbols == 0
    }
}

/// An ordered group of blocks sharing a list format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextList {
    pub id: TextListId,
    pub format: ListFormat,
    /// Member blocks in sequence order
    pub blocks: Vec<TextBlockId>,
}

impl TextList {
    pub fn new(id: TextListId, format: ListFormat) -> Self {
        Self {
            id,
            format,
            blocks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, block: &TextBlockId) -> bool {
        self.blocks.contains(block)
    }
}

/// A list membership change to announce to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListChange {
    pub block: TextBlockId,
    /// `None` removes the block from any list
    pub list: Option<TextListId>,
    pub format: ListFormat,
}
