//! Document types and operations

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{ListChange, TextBlock, TextBlockId, TextList, TextListId};
use crate::error::{Error, Result};
use crate::format::{BlockFormat, CharFormat, ListFormat};
use crate::position::{allocate, Clock, Position, SiteId};
use crate::symbol::{AuthorId, Symbol};
use crate::user::UserId;

/// Maximum URI length in bytes
pub const MAX_URI_LEN: usize = 512;

/// Document identifier - UTF-8 string, max 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentUri(String);

impl DocumentUri {
    /// Create a document URI, validating the format
    pub fn new(uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();

        if uri.is_empty() {
            return Err(Error::InvalidUri("Document URI cannot be empty".into()));
        }

        if uri.len() > MAX_URI_LEN {
            return Err(Error::InvalidUri("Document URI exceeds 512 bytes".into()));
        }

        // Validate pattern: [a-zA-Z0-9:_-]+
        if !uri.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-') {
            return Err(Error::InvalidUri("Document URI must match pattern [a-zA-Z0-9:_-]+".into()));
        }

        Ok(Self(uri))
    }

    /// Mint a fresh URI for a document named `name` owned by `owner`
    pub fn generate(owner: &str, name: &str) -> Self {
        let slug: String = name
            .chars()
            .take(64)
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
            .collect();
        let owner: String = owner
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .take(64)
            .collect();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}:{}:{}", owner, slug, &nonce[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Document metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub uri: DocumentUri,
    pub name: String,
    pub owner: UserId,
    pub created_at: u64,
    pub updated_at: u64,
    pub version: u64,
}

impl DocumentMeta {
    pub fn new(uri: DocumentUri, name: impl Into<String>, owner: UserId) -> Self {
        let now = now_millis();

        Self {
            uri,
            name: name.into(),
            owner,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Record a modification
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = now_millis();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Serializable image of a [`Document`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Symbols in position order
    pub symbols: Vec<Symbol>,
    /// Blocks sorted by id
    pub blocks: Vec<TextBlock>,
    /// Lists sorted by id
    pub lists: Vec<TextList>,
    pub block_counters: Vec<(AuthorId, u32)>,
    pub list_counters: Vec<(AuthorId, u32)>,
    /// Highest position clock the document has seen
    #[serde(default)]
    pub clock: Clock,
}

impl DocumentSnapshot {
    /// Encode as MessagePack
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from MessagePack
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// A rich-text document: position-ordered symbols plus block and list tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    symbols: Vec<Symbol>,
    blocks: HashMap<TextBlockId, TextBlock>,
    lists: HashMap<TextListId, TextList>,
    block_counters: BTreeMap<AuthorId, u32>,
    list_counters: BTreeMap<AuthorId, u32>,
    clock: Clock,
}

impl Document {
    /// Create an empty document with no blocks
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty document holding one root block minted by `author`
    pub fn with_root_block(author: AuthorId) -> Self {
        let mut doc = Self::new();
        doc.new_block(author, BlockFormat::default());
        doc
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn get(&self, index: usize) -> Option<&Symbol> {
        self.symbols.get(index)
    }

    /// Plain text of the document
    pub fn text(&self) -> String {
        self.symbols.iter().map(|s| s.ch).collect()
    }

    /// Index of the symbol at `position`
    pub fn index_of(&self, position: &Position) -> Option<usize> {
        self.search(position).ok()
    }

    fn search(&self, position: &Position) -> std::result::Result<usize, usize> {
        self.symbols.binary_search_by(|s| s.position.cmp(position))
    }

    // ---------------------------------------------------------------------
    // Symbols
    // ---------------------------------------------------------------------

    /// Insert a symbol at its position and return the resulting index.
    ///
    /// A symbol naming an unknown block creates that block with the default format.
    pub fn insert(&mut self, symbol: Symbol) -> Result<usize> {
        self.observe_clock(&symbol.position);
        let index = match self.search(&symbol.position) {
            Ok(_) => return Err(Error::DuplicatePosition(symbol.position)),
            Err(index) => index,
        };

        let block_id = symbol.block;
        self.ensure_block(block_id, BlockFormat::default());
        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.symbols += 1;
        }

        let opens_block = index == 0 || self.symbols[index - 1].block != block_id;
        self.symbols.insert(index, symbol);

        if opens_block {
            self.resort_list_of(block_id);
        }
        Ok(index)
    }

    /// Remove the symbol at `index`, returning its position for announcement to peers
    pub fn remove_at_index(&mut self, index: usize) -> Result<Position> {
        if index >= self.symbols.len() {
            return Err(Error::IndexOutOfBounds {
                index,
                len: self.symbols.len(),
            });
        }
        Ok(self.remove_index(index).position)
    }

    /// Remove the symbol at `position`.
    ///
    /// Returns `None` when the position is absent (already removed), so deletes are idempotent.
    pub fn remove_at_position(&mut self, position: &Position) -> Option<usize> {
        self.observe_clock(position);
        match self.search(position) {
            Ok(index) => {
                self.remove_index(index);
                Some(index)
            }
            Err(_) => {
                debug!(position = %position, "Delete of absent position ignored");
                None
            }
        }
    }

    fn remove_index(&mut self, index: usize) -> Symbol {
        let symbol = self.symbols.remove(index);
        let block_id = symbol.block;

        // An emptied block stays in the table with its format and list, so a concurrent
        // insert into it lands in the same list on every replica.
        let emptied = match self.blocks.get_mut(&block_id) {
            Some(block) => {
                block.symbols = block.symbols.saturating_sub(1);
                block.symbols == 0
            }
            None => false,
        };

        let opened_block = self.symbols.get(index).map_or(false, |s| s.block == block_id)
            && (index == 0 || self.symbols[index - 1].block != block_id);
        if emptied || opened_block {
            self.resort_list_of(block_id);
        }

        symbol
    }

    /// Replace the format of the symbol at `position`; the symbol does not move.
    pub fn format_symbol(&mut self, position: &Position, format: CharFormat) -> Option<usize> {
        let index = self.search(position).ok()?;
        self.symbols[index].format = format;
        Some(index)
    }

    /// Position for a new symbol at the start of the document
    pub fn fractional_pos_begin(&mut self, site: SiteId) -> Result<Position> {
        self.fractional_pos_at_index(0, site)
    }

    /// Position for a new symbol at the end of the document
    pub fn fractional_pos_end(&mut self, site: SiteId) -> Result<Position> {
        self.fractional_pos_at_index(self.symbols.len(), site)
    }

    /// Position for a new symbol that will land at `index`.
    ///
    /// Every call ticks the document clock, so a position is never handed out twice, not
    /// even for a gap whose previous occupant was deleted.
    pub fn fractional_pos_at_index(&mut self, index: usize, site: SiteId) -> Result<Position> {
        if index > self.symbols.len() {
            return Err(Error::IndexOutOfBounds {
                index,
                len: self.symbols.len(),
            });
        }
        let clock = self.clock.saturating_add(1);
        let before = index.checked_sub(1).map(|i| &self.symbols[i].position);
        let after = self.symbols.get(index).map(|s| &s.position);
        let position = allocate(before, after, site, clock)?;
        self.clock = clock;
        Ok(position)
    }

    /// Current value of the document clock
    pub fn clock(&self) -> Clock {
        self.clock
    }

    fn observe_clock(&mut self, position: &Position) {
        self.clock = self.clock.max(position.max_clock());
    }

    // ---------------------------------------------------------------------
    // Blocks
    // ---------------------------------------------------------------------

    pub fn block(&self, id: &TextBlockId) -> Option<&TextBlock> {
        self.blocks.get(id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &TextBlock> {
        self.blocks.values()
    }

    /// Mint a new block id for `author` and create the block
    pub fn new_block(&mut self, author: AuthorId, format: BlockFormat) -> TextBlockId {
        let counter = self.block_counters.entry(author).or_insert(0);
        let id = TextBlockId::new(*counter, author);
        *counter += 1;
        self.blocks.insert(id, TextBlock::new(id, format));
        id
    }

    /// Create the block if it does not exist yet. Returns true if it was created.
    pub fn ensure_block(&mut self, id: TextBlockId, format: BlockFormat) -> bool {
        if self.blocks.contains_key(&id) {
            return false;
        }
        observe(&mut self.block_counters, id.author, id.counter);
        self.blocks.insert(id, TextBlock::new(id, format));
        true
    }

    /// Block of the symbol at `index`
    pub fn block_at(&self, index: usize) -> Option<TextBlockId> {
        self.symbols.get(index).map(|s| s.block)
    }

    /// Blocks touched by the symbols in `start..=end`, in sequence order
    pub fn blocks_between(&self, start: usize, end: usize) -> Vec<TextBlockId> {
        let mut out: Vec<TextBlockId> = Vec::new();
        if self.symbols.is_empty() || start > end {
            return out;
        }
        let end = end.min(self.symbols.len() - 1);
        for symbol in self.symbols.iter().take(end + 1).skip(start) {
            if !out.contains(&symbol.block) {
                out.push(symbol.block);
            }
        }
        out
    }

    /// Index of the first symbol of a block
    pub fn block_position(&self, id: &TextBlockId) -> Option<usize> {
        self.symbols.iter().position(|s| s.block == *id)
    }

    /// Replace a block's format.
    ///
    /// Returns the index of the block's first symbol, or `None` if it holds no symbols yet.
    pub fn format_block(&mut self, id: &TextBlockId, format: BlockFormat) -> Result<Option<usize>> {
        let block = self.blocks.get_mut(id).ok_or(Error::UnknownBlock(*id))?;
        block.format = format;
        Ok(self.block_position(id))
    }

    // ---------------------------------------------------------------------
    // Lists
    // ---------------------------------------------------------------------

    pub fn list(&self, id: &TextListId) -> Option<&TextList> {
        self.lists.get(id)
    }

    pub fn lists(&self) -> impl Iterator<Item = &TextList> {
        self.lists.values()
    }

    /// Mint a new list id for `author` and create the (empty) list
    pub fn new_list(&mut self, author: AuthorId, format: ListFormat) -> TextListId {
        let counter = self.list_counters.entry(author).or_insert(0);
        let id = TextListId::new(*counter, author);
        *counter += 1;
        self.lists.insert(id, TextList::new(id, format));
        id
    }

    /// Member blocks of a list in sequence order
    pub fn list_blocks(&self, id: &TextListId) -> Result<&[TextBlockId]> {
        self.lists
            .get(id)
            .map(|l| l.blocks.as_slice())
            .ok_or(Error::UnknownList(*id))
    }

    /// List of the block holding the symbol at `index`
    pub fn list_at(&self, index: usize) -> Option<TextListId> {
        self.block_at(index)
            .and_then(|b| self.blocks.get(&b))
            .and_then(|b| b.list)
    }

    /// Index of the first symbol of the list's first block
    pub fn list_position(&self, id: &TextListId) -> Option<usize> {
        let first = self.lists.get(id)?.blocks.first()?;
        self.block_position(first)
    }

    /// Add a block to a list, taking it out of any list it was in
    pub fn add_block_to_list(&mut self, block_id: TextBlockId, list_id: TextListId) -> Result<()> {
        if !self.lists.contains_key(&list_id) {
            return Err(Error::UnknownList(list_id));
        }
        let previous = self
            .blocks
            .get(&block_id)
            .ok_or(Error::UnknownBlock(block_id))?
            .list;

        if previous == Some(list_id) {
            return Ok(());
        }
        if let Some(old) = previous.and_then(|id| self.lists.get_mut(&id)) {
            old.blocks.retain(|b| *b != block_id);
        }
        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.list = Some(list_id);
        }
        if let Some(list) = self.lists.get_mut(&list_id) {
            list.blocks.push(block_id);
        }
        self.resort_list(list_id);
        Ok(())
    }

    /// Take a block out of a list; the list survives even when left empty
    pub fn remove_block_from_list(
        &mut self,
        block_id: TextBlockId,
        list_id: TextListId,
    ) -> Result<()> {
        let list = self.lists.get_mut(&list_id).ok_or(Error::UnknownList(list_id))?;
        let block = self.blocks.get_mut(&block_id).ok_or(Error::UnknownBlock(block_id))?;

        list.blocks.retain(|b| *b != block_id);
        if block.list == Some(list_id) {
            block.list = None;
        }
        Ok(())
    }

    /// Reassign a block's list membership and the list format as one unit.
    ///
    /// `list == None` takes the block out of its list. A list id not seen before is created
    /// with `format`.
    pub fn edit_block_list(
        &mut self,
        block_id: TextBlockId,
        list: Option<TextListId>,
        format: ListFormat,
    ) -> Result<()> {
        let current = self
            .blocks
            .get(&block_id)
            .ok_or(Error::UnknownBlock(block_id))?
            .list;

        if current == list {
            return Ok(());
        }
        if let Some(old) = current {
            self.remove_block_from_list(block_id, old)?;
        }

        if let Some(list_id) = list {
            match self.lists.get_mut(&list_id) {
                Some(existing) => existing.format = format,
                None => {
                    observe(&mut self.list_counters, list_id.author, list_id.counter);
                    self.lists.insert(list_id, TextList::new(list_id, format));
                }
            }
            self.add_block_to_list(block_id, list_id)?;
        }
        Ok(())
    }

    /// Toggle list formatting over the blocks touched by `start..=end`.
    ///
    /// Selected blocks leave their lists; list members after the selection move to a new list
    /// keeping the old format. With `format` set, the selected blocks are gathered into a new
    /// list. Returns the membership changes peers need to replay.
    pub fn toggle_list(
        &mut self,
        start: usize,
        end: usize,
        format: Option<ListFormat>,
        author: AuthorId,
    ) -> Vec<ListChange> {
        let selected = self.blocks_between(start, end);
        let mut changes = Vec::new();
        if selected.is_empty() {
            return changes;
        }

        let mut involved: Vec<TextListId> = Vec::new();
        for id in &selected {
            if let Some(list) = self.blocks.get(id).and_then(|b| b.list) {
                if !involved.contains(&list) {
                    involved.push(list);
                }
            }
        }

        for old_id in involved {
            let (old_format, members) = match self.lists.get(&old_id) {
                Some(list) => (list.format, list.blocks.clone()),
                None => continue,
            };

            let mut begun = false;
            let mut split: Option<TextListId> = None;

            for block_id in members {
                if !begun {
                    if selected.contains(&block_id) {
                        begun = true;
                        let _ = self.remove_block_from_list(block_id, old_id);
                    }
                    continue;
                }

                let _ = self.remove_block_from_list(block_id, old_id);
                if selected.contains(&block_id) {
                    continue;
                }

                let target = match split {
                    Some(id) => id,
                    None => {
                        let id = self.new_list(author, old_format);
                        split = Some(id);
                        id
                    }
                };
                let _ = self.add_block_to_list(block_id, target);
                changes.push(ListChange {
                    block: block_id,
                    list: Some(target),
                    format: old_format,
                });
            }
        }

        match format {
            None => {
                for block_id in selected {
                    let _ = self.edit_block_list(block_id, None, ListFormat::default());
                    changes.push(ListChange {
                        block: block_id,
                        list: None,
                        format: ListFormat::default(),
                    });
                }
            }
            Some(format) => {
                let list_id = self.new_list(author, format);
                for block_id in selected {
                    let _ = self.add_block_to_list(block_id, list_id);
                    changes.push(ListChange {
                        block: block_id,
                        list: Some(list_id),
                        format,
                    });
                }
            }
        }

        changes
    }

    fn resort_list_of(&mut self, block_id: TextBlockId) {
        if let Some(list_id) = self.blocks.get(&block_id).and_then(|b| b.list) {
            self.resort_list(list_id);
        }
    }

    /// Keep a list's members in sequence order; blocks without symbols go last
    fn resort_list(&mut self, list_id: TextListId) {
        let mut first_index: HashMap<TextBlockId, usize> = HashMap::new();
        for (i, s) in self.symbols.iter().enumerate() {
            first_index.entry(s.block).or_insert(i);
        }
        if let Some(list) = self.lists.get_mut(&list_id) {
            list.blocks
                .sort_by_key(|b| (first_index.get(b).copied().unwrap_or(usize::MAX), *b));
        }
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Capture a consistent, deterministic image of the document
    pub fn snapshot(&self) -> DocumentSnapshot {
        // Symbol counts are rebuilt on restore and stay out of the image.
        let mut blocks: Vec<TextBlock> = self
            .blocks
            .values()
            .map(|b| TextBlock {
                symbols: 0,
                ..b.clone()
            })
            .collect();
        blocks.sort_by_key(|b| b.id);
        let mut lists: Vec<TextList> = self.lists.values().cloned().collect();
        lists.sort_by_key(|l| l.id);

        DocumentSnapshot {
            symbols: self.symbols.clone(),
            blocks,
            lists,
            block_counters: self.block_counters.iter().map(|(a, c)| (*a, *c)).collect(),
            list_counters: self.list_counters.iter().map(|(a, c)| (*a, *c)).collect(),
            clock: self.clock,
        }
    }

    /// Rebuild a document from a snapshot, validating its invariants
    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Result<Self> {
        if !snapshot.symbols.windows(2).all(|w| w[0].position < w[1].position) {
            return Err(Error::RestoreError("symbols are not strictly position-ordered".into()));
        }

        let mut doc = Document {
            symbols: Vec::new(),
            blocks: HashMap::new(),
            lists: HashMap::new(),
            block_counters: snapshot.block_counters.into_iter().collect(),
            list_counters: snapshot.list_counters.into_iter().collect(),
            clock: snapshot.clock,
        };

        for mut block in snapshot.blocks {
            block.symbols = 0;
            observe(&mut doc.block_counters, block.id.author, block.id.counter);
            doc.blocks.insert(block.id, block);
        }
        for list in snapshot.lists {
            observe(&mut doc.list_counters, list.id.author, list.id.counter);
            doc.lists.insert(list.id, list);
        }

        for symbol in &snapshot.symbols {
            let block = doc.blocks.get_mut(&symbol.block).ok_or_else(|| {
                Error::RestoreError(format!(
                    "symbol at {} names unknown {}",
                    symbol.position, symbol.block
                ))
            })?;
            block.symbols += 1;
            doc.clock = doc.clock.max(symbol.position.max_clock());
        }
        doc.symbols = snapshot.symbols;

        for block in doc.blocks.values() {
            if let Some(list_id) = block.list {
                let list = doc.lists.get(&list_id).ok_or_else(|| {
                    Error::RestoreError(format!("{} names unknown {}", block.id, list_id))
                })?;
                if !list.contains(&block.id) {
                    let reason = format!("{} missing from {}", block.id, list_id);
                    return Err(Error::RestoreError(reason));
                }
            }
        }
        for list in doc.lists.values() {
            for member in &list.blocks {
                let listed = doc.blocks.get(member).map_or(false, |b| b.list == Some(list.id));
                if !listed {
                    return Err(Error::RestoreError(format!("{} lists stray {}", list.id, member)));
                }
            }
        }

        Ok(doc)
    }
}

/// Raise an author's counter past an id minted elsewhere
fn observe(counters: &mut BTreeMap<AuthorId, u32>, author: AuthorId, counter: u32) {
    let next = counters.entry(author).or_insert(0);
    if *next <= counter {
        *next = counter.saturating_add(1);
    }
}
