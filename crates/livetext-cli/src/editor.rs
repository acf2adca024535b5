//! Local replica of the open document
//!
//! Local commands edit the replica first and return the messages to send; remote messages
//! are applied by Position so the replica converges with the server's copy.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use livetext_core::{
    Alignment, BlockFormat, CharFormat, Document, DocumentMeta, DocumentUri, ListFormat, ListStyle,
    Position, Symbol, TextBlockId, User, UserId, PARAGRAPH_SEPARATOR,
};
use livetext_protocol::{
    BlockEdit, CharsDelete, CharsFormat, CharsInsert, CursorMove, DocumentReady, ListEdit, Message,
    ProfileUpdate, UserJoin, UserLeave,
};

/// Another editor of the open document
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub nickname: String,
    pub cursor: Option<Position>,
}

/// What an incoming message meant for the user
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    LoggedIn(User),
    LoggedOut,
    Opened(DocumentMeta),
    Dismissed(DocumentUri),
    Rejected(String),
    Edited,
    PeerJoined(String),
    PeerLeft(String),
    /// Liveness check; answer with `Pong`
    Pinged,
    Failure(String),
    Quiet,
}

/// An open document together with its metadata
pub struct OpenDocument {
    pub meta: DocumentMeta,
    pub document: Document,
    pub peers: BTreeMap<UserId, Peer>,
}

#[derive(Default)]
pub struct Editor {
    user: Option<User>,
    open: Option<OpenDocument>,
}

impl Editor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn open_document(&self) -> Option<&OpenDocument> {
        self.open.as_ref()
    }

    /// Forget the open document
    pub fn close(&mut self) -> Option<DocumentUri> {
        self.open.take().map(|open| open.meta.uri)
    }

    fn site(&self) -> Result<UserId> {
        self.user
            .as_ref()
            .map(|u| u.user_id)
            .ok_or_else(|| anyhow!("not logged in"))
    }

    fn document_mut(&mut self) -> Result<&mut Document> {
        self.open
            .as_mut()
            .map(|open| &mut open.document)
            .ok_or_else(|| anyhow!("no open document"))
    }

    /// Apply a message from the server
    pub fn handle(&mut self, message: Message) -> Notice {
        match message {
            Message::LoginGranted(granted) => self.logged_in(granted.user),
            Message::AccountConfirmed(confirmed) => self.logged_in(confirmed.user),
            Message::LoginError(e) => Notice::Rejected(e.reason),
            Message::AccountError(e) => Notice::Rejected(e.reason),
            Message::LogoutConfirmed(_) => {
                self.user = None;
                self.open = None;
                Notice::LoggedOut
            }
            Message::DocumentReady(DocumentReady { meta, snapshot }) => {
                match Document::from_snapshot(snapshot) {
                    Ok(document) => {
                        if let Some(user) = self.user.as_mut() {
                            user.add_document(meta.uri.clone());
                        }
                        self.open = Some(OpenDocument {
                            meta: meta.clone(),
                            document,
                            peers: BTreeMap::new(),
                        });
                        Notice::Opened(meta)
                    }
                    Err(e) => Notice::Rejected(format!("unreadable snapshot: {}", e)),
                }
            }
            Message::DocumentDismissed(dismissed) => {
                if let Some(user) = self.user.as_mut() {
                    user.remove_document(&dismissed.uri);
                }
                if self.open.as_ref().map(|o| &o.meta.uri) == Some(&dismissed.uri) {
                    self.open = None;
                }
                Notice::Dismissed(dismissed.uri)
            }
            Message::DocumentError(e) => Notice::Rejected(e.reason),
            Message::UserJoin(UserJoin { user_id, nickname, .. }) => match self.open.as_mut() {
                Some(open) => {
                    open.peers.insert(
                        user_id,
                        Peer {
                            nickname: nickname.clone(),
                            cursor: None,
                        },
                    );
                    Notice::PeerJoined(nickname)
                }
                None => Notice::Quiet,
            },
            Message::UserLeave(UserLeave { user_id }) => {
                let left = self.open.as_mut().and_then(|o| o.peers.remove(&user_id));
                left.map_or(Notice::Quiet, |peer| Notice::PeerLeft(peer.nickname))
            }
            Message::ProfileUpdate(ProfileUpdate { user_id, nickname, .. }) => {
                if let Some(peer) = self.open.as_mut().and_then(|o| o.peers.get_mut(&user_id)) {
                    peer.nickname = nickname;
                }
                Notice::Quiet
            }
            Message::CursorMove(CursorMove { user_id, position }) => {
                if let Some(peer) = self.open.as_mut().and_then(|o| o.peers.get_mut(&user_id)) {
                    peer.cursor = position;
                }
                Notice::Quiet
            }
            Message::Ping(_) => Notice::Pinged,
            Message::Pong(_) => Notice::Quiet,
            Message::Failure(failure) => Notice::Failure(failure.reason),
            edit if edit.is_edit() => match self.open.as_mut() {
                Some(open) => {
                    if apply_remote(&mut open.document, edit) {
                        Notice::Edited
                    } else {
                        Notice::Quiet
                    }
                }
                None => Notice::Quiet,
            },
            _ => Notice::Quiet,
        }
    }

    fn logged_in(&mut self, user: User) -> Notice {
        self.user = Some(user.clone());
        Notice::LoggedIn(user)
    }

    /// Insert `text` before `index`. A newline ends the current paragraph.
    ///
    /// Text that followed the cursor in a split paragraph moves to the paragraph the
    /// newline opens: it is deleted and typed again there, and the new paragraph joins
    /// the list of the one it was split from.
    pub fn insert(&mut self, index: usize, text: &str) -> Result<Vec<Message>> {
        let site = self.site()?;
        let doc = self.document_mut()?;
        if index > doc.len() {
            bail!("index {} is past the end ({})", index, doc.len());
        }

        let origin = block_for_insert(doc, index, site);
        let format = doc.block(&origin).map(|b| b.format.clone()).unwrap_or_default();
        let trailing = if text.contains('\n') {
            paragraph_tail(doc, index, origin)
        } else {
            Vec::new()
        };

        let mut block = origin;
        let mut minted: Vec<TextBlockId> = Vec::new();
        let mut split = false;
        let mut batches: Vec<Message> = Vec::new();
        let mut current: Vec<Symbol> = Vec::new();
        let mut at = index;

        for ch in text.chars() {
            if split {
                block = doc.new_block(site, format.clone());
                minted.push(block);
                split = false;
            }
            let ch = if ch == '\n' { PARAGRAPH_SEPARATOR } else { ch };
            let position = doc.fractional_pos_at_index(at, site)?;
            let symbol = Symbol::new(ch, CharFormat::default(), site, position, block);
            doc.insert(symbol.clone())?;
            current.push(symbol);
            at += 1;

            if ch == PARAGRAPH_SEPARATOR {
                batches.push(
                    CharsInsert {
                        symbols: std::mem::take(&mut current),
                        block,
                        block_format: format.clone(),
                    }
                    .into(),
                );
                split = true;
            }
        }

        let mut moved = Vec::with_capacity(trailing.len());
        if !trailing.is_empty() {
            if split {
                block = doc.new_block(site, format.clone());
                minted.push(block);
            }
            for old in trailing {
                doc.remove_at_position(&old.position);
                moved.push(old.position);
                let position = doc.fractional_pos_at_index(at, site)?;
                let symbol = Symbol::new(old.ch, old.format, site, position, block);
                doc.insert(symbol.clone())?;
                current.push(symbol);
                at += 1;
            }
        }
        if !current.is_empty() {
            batches.push(
                CharsInsert {
                    symbols: current,
                    block,
                    block_format: format,
                }
                .into(),
            );
        }
        if !moved.is_empty() {
            batches.push(CharsDelete { positions: moved }.into());
        }

        let list = doc.block(&origin).and_then(|b| b.list);
        if let Some(list_id) = list {
            let list_format = doc.list(&list_id).map(|l| l.format).unwrap_or_default();
            for id in minted {
                doc.edit_block_list(id, Some(list_id), list_format)?;
                batches.push(
                    ListEdit {
                        block: id,
                        list: Some(list_id),
                        format: list_format,
                    }
                    .into(),
                );
            }
        }

        Ok(batches)
    }

    /// Delete `count` symbols starting at `index`
    pub fn delete(&mut self, index: usize, count: usize) -> Result<Option<Message>> {
        let doc = self.document_mut()?;
        let mut positions = Vec::new();
        for _ in 0..count {
            if index >= doc.len() {
                break;
            }
            positions.push(doc.remove_at_index(index)?);
        }
        Ok((!positions.is_empty()).then(|| CharsDelete { positions }.into()))
    }

    /// Toggle bold on the symbol at `index`
    pub fn toggle_bold(&mut self, index: usize) -> Result<Message> {
        let doc = self.document_mut()?;
        let symbol = doc
            .get(index)
            .ok_or_else(|| anyhow!("no character at {}", index))?;
        let position = symbol.position.clone();
        let format = CharFormat {
            bold: !symbol.format.bold,
            ..symbol.format.clone()
        };
        doc.format_symbol(&position, format.clone());
        Ok(CharsFormat {
            positions: vec![position],
            formats: vec![format],
        }
        .into())
    }

    /// Align the paragraph holding the symbol at `index`
    pub fn align(&mut self, index: usize, alignment: Alignment) -> Result<Message> {
        let doc = self.document_mut()?;
        let block = doc
            .block_at(index)
            .ok_or_else(|| anyhow!("no paragraph at {}", index))?;
        let format = BlockFormat {
            alignment,
            ..doc.block(&block).map(|b| b.format.clone()).unwrap_or_default()
        };
        doc.format_block(&block, format.clone())?;
        Ok(BlockEdit { block, format }.into())
    }

    /// Put the paragraphs of `start..=end` into a list, or take them out with `None`
    pub fn toggle_list(
        &mut self,
        start: usize,
        end: usize,
        style: Option<ListStyle>,
    ) -> Result<Vec<Message>> {
        let site = self.site()?;
        let doc = self.document_mut()?;
        let changes = doc.toggle_list(start, end, style.map(ListFormat::new), site);
        Ok(changes
            .into_iter()
            .map(|change| {
                ListEdit {
                    block: change.block,
                    list: change.list,
                    format: change.format,
                }
                .into()
            })
            .collect())
    }
}

/// Block a new symbol at `index` joins
fn block_for_insert(doc: &mut Document, index: usize, site: UserId) -> TextBlockId {
    if let Some(block) = doc.block_at(index) {
        return block;
    }
    // Appending: continue the last paragraph unless it is closed.
    match index.checked_sub(1).and_then(|i| doc.get(i)) {
        Some(last) if !last.is_paragraph_separator() => last.block,
        Some(last) => {
            let format = doc.block(&last.block).map(|b| b.format.clone()).unwrap_or_default();
            doc.new_block(site, format)
        }
        None => {
            let root = doc.blocks().next().map(|root| root.id);
            match root {
                Some(root) => root,
                None => doc.new_block(site, BlockFormat::default()),
            }
        }
    }
}

/// Symbols of `block` from `index` up to and including its paragraph separator
fn paragraph_tail(doc: &Document, index: usize, block: TextBlockId) -> Vec<Symbol> {
    let mut tail = Vec::new();
    for symbol in doc.symbols().iter().skip(index) {
        if symbol.block != block {
            break;
        }
        tail.push(symbol.clone());
        if symbol.is_paragraph_separator() {
            break;
        }
    }
    tail
}

/// Apply an edit received from the server. Returns true if the replica changed.
pub fn apply_remote(doc: &mut Document, message: Message) -> bool {
    match message {
        Message::CharsInsert(CharsInsert {
            symbols,
            block,
            block_format,
        }) => {
            if symbols.iter().any(|s| doc.index_of(&s.position).is_none()) {
                doc.ensure_block(block, block_format);
            }
            let mut changed = false;
            for symbol in symbols {
                changed |= doc.insert(symbol).is_ok();
            }
            changed
        }
        Message::CharsDelete(CharsDelete { positions }) => {
            let mut changed = false;
            for position in &positions {
                changed |= doc.remove_at_position(position).is_some();
            }
            changed
        }
        Message::CharsFormat(CharsFormat { positions, formats }) => {
            let mut changed = false;
            for (position, format) in positions.iter().zip(formats) {
                changed |= doc.format_symbol(position, format).is_some();
            }
            changed
        }
        Message::BlockEdit(BlockEdit { block, format }) => doc.format_block(&block, format).is_ok(),
        Message::ListEdit(ListEdit { block, list, format }) => {
            doc.edit_block_list(block, list, format).is_ok()
        }
        _ => false,
    }
}

/// One displayed paragraph
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub text: String,
    pub alignment: Alignment,
    /// List style and 1-based item number, for list members
    pub item: Option<(ListStyle, usize)>,
}

/// Split the replica into paragraphs for display
pub fn render(doc: &Document) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut text = String::new();
    let mut block: Option<TextBlockId> = None;

    let mut flush = |text: &mut String, block: Option<TextBlockId>| {
        let Some(id) = block else { return };
        let info = doc.block(&id);
        let item = info.and_then(|b| b.list).and_then(|list_id| {
            let list = doc.list(&list_id)?;
            let number = list.blocks.iter().position(|b| *b == id)? + 1;
            Some((list.format.style, number))
        });
        lines.push(Line {
            text: std::mem::take(text),
            alignment: info.map(|b| b.format.alignment).unwrap_or_default(),
            item,
        });
    };

    for symbol in doc.symbols() {
        if block != Some(symbol.block) && !text.is_empty() {
            flush(&mut text, block);
        }
        block = Some(symbol.block);
        if symbol.is_paragraph_separator() {
            flush(&mut text, block);
            block = None;
        } else {
            text.push(symbol.ch);
        }
    }
    if block.is_some() {
        flush(&mut text, block);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetext_protocol::{AccountConfirmed, DocumentDismissed, LoginGranted, LogoutConfirmed};

    fn logged_in(user_id: UserId, doc: Document) -> Editor {
        let mut editor = Editor::new();
        let user = User::new(user_id, format!("user{}", user_id), "Nick");
        editor.handle(LoginGranted { user }.into());
        let uri = DocumentUri::generate("owner", "doc");
        let notice = editor.handle(
            DocumentReady {
                meta: DocumentMeta::new(uri, "doc", 1),
                snapshot: doc.snapshot(),
            }
            .into(),
        );
        assert!(matches!(notice, Notice::Opened(_)));
        editor
    }

    fn text(editor: &Editor) -> String {
        editor.open_document().unwrap().document.text()
    }

    #[test]
    fn test_edits_require_login_and_document() {
        let mut editor = Editor::new();
        assert!(editor.insert(0, "a").is_err());

        editor.handle(AccountConfirmed { user: User::new(1, "a", "A") }.into());
        assert!(editor.insert(0, "a").is_err());
    }

    #[test]
    fn test_local_insert_reaches_peer() {
        let root = Document::with_root_block(1);
        let mut alice = logged_in(1, root.clone());
        let mut bob = logged_in(2, root);

        for message in alice.insert(0, "hello").unwrap() {
            bob.handle(message);
        }
        for message in bob.insert(5, " world").unwrap() {
            alice.handle(message);
        }

        assert_eq!(text(&alice), "hello world");
        assert_eq!(text(&bob), "hello world");
    }

    #[test]
    fn test_newline_starts_new_paragraph() {
        let mut editor = logged_in(1, Document::with_root_block(1));
        let messages = editor.insert(0, "ab\ncd").unwrap();
        assert_eq!(messages.len(), 2);

        let lines = render(&editor.open_document().unwrap().document);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "ab");
        assert_eq!(lines[1].text, "cd");
    }

    #[test]
    fn test_newline_mid_paragraph_moves_tail() {
        let root = Document::with_root_block(1);
        let mut alice = logged_in(1, root.clone());
        let mut bob = logged_in(2, root);

        let mut outbox = alice.insert(0, "abxyz").unwrap();
        outbox.extend(alice.insert(2, "\n").unwrap());
        outbox.push(alice.align(3, Alignment::Right).unwrap());
        for message in outbox {
            bob.handle(message);
        }

        let alice_doc = &alice.open_document().unwrap().document;
        let bob_doc = &bob.open_document().unwrap().document;
        let lines = render(bob_doc);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "ab");
        assert_eq!(lines[0].alignment, Alignment::Left);
        assert_eq!(lines[1].text, "xyz");
        assert_eq!(lines[1].alignment, Alignment::Right);
        assert_ne!(bob_doc.block_at(0), bob_doc.block_at(3));
        assert_eq!(alice_doc.symbols(), bob_doc.symbols());
    }

    #[test]
    fn test_split_list_item_stays_in_list() {
        let root = Document::with_root_block(1);
        let mut alice = logged_in(1, root.clone());
        let mut bob = logged_in(2, root);

        let mut outbox = alice.insert(0, "onetwo").unwrap();
        outbox.extend(alice.toggle_list(0, 0, Some(ListStyle::Disc)).unwrap());
        outbox.extend(alice.insert(3, "\n").unwrap());
        for message in outbox {
            bob.handle(message);
        }

        let lines = render(&bob.open_document().unwrap().document);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "one");
        assert_eq!(lines[0].item, Some((ListStyle::Disc, 1)));
        assert_eq!(lines[1].text, "two");
        assert_eq!(lines[1].item, Some((ListStyle::Disc, 2)));
    }

    #[test]
    fn test_trailing_newline_mints_no_block() {
        let mut editor = logged_in(1, Document::with_root_block(1));
        editor.insert(0, "ab\n").unwrap();
        assert_eq!(editor.open_document().unwrap().document.blocks().count(), 1);

        editor.insert(3, "c").unwrap();
        let lines = render(&editor.open_document().unwrap().document);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].text, "c");
    }

    #[test]
    fn test_delete_bold_align_replicate() {
        let root = Document::with_root_block(1);
        let mut alice = logged_in(1, root.clone());
        let mut bob = logged_in(2, root);

        let mut outbox = alice.insert(0, "abcd").unwrap();
        outbox.extend(alice.delete(1, 2).unwrap());
        outbox.push(alice.toggle_bold(0).unwrap());
        outbox.push(alice.align(0, Alignment::Center).unwrap());
        for message in outbox {
            bob.handle(message);
        }

        let doc = &bob.open_document().unwrap().document;
        assert_eq!(doc.text(), "ad");
        assert!(doc.get(0).unwrap().format.bold);
        assert_eq!(render(doc)[0].alignment, Alignment::Center);
        assert_eq!(alice.open_document().unwrap().document.snapshot(), doc.snapshot());
    }

    #[test]
    fn test_delete_past_end_sends_nothing() {
        let mut editor = logged_in(1, Document::with_root_block(1));
        assert_eq!(editor.delete(0, 3).unwrap(), None);
    }

    #[test]
    fn test_list_toggle_replicates() {
        let root = Document::with_root_block(1);
        let mut alice = logged_in(1, root.clone());
        let mut bob = logged_in(2, root);

        let mut outbox = alice.insert(0, "one\ntwo\nthree").unwrap();
        outbox.extend(alice.toggle_list(0, 7, Some(ListStyle::Decimal)).unwrap());
        for message in outbox {
            bob.handle(message);
        }

        let lines = render(&bob.open_document().unwrap().document);
        assert_eq!(lines[0].item, Some((ListStyle::Decimal, 1)));
        assert_eq!(lines[1].item, Some((ListStyle::Decimal, 2)));
        assert_eq!(lines[2].item, None);

        for message in alice.toggle_list(0, 0, None).unwrap() {
            bob.handle(message);
        }
        let lines = render(&bob.open_document().unwrap().document);
        assert_eq!(lines[0].item, None);
        assert_eq!(lines[1].item, Some((ListStyle::Decimal, 1)));
    }

    #[test]
    fn test_presence_tracking() {
        let mut editor = logged_in(1, Document::with_root_block(1));
        let joined = editor.handle(
            UserJoin {
                user_id: 2,
                nickname: "bob".into(),
                icon: vec![],
            }
            .into(),
        );
        assert_eq!(joined, Notice::PeerJoined("bob".into()));
        assert_eq!(editor.handle(UserLeave { user_id: 2 }.into()), Notice::PeerLeft("bob".into()));
        assert_eq!(editor.handle(UserLeave { user_id: 2 }.into()), Notice::Quiet);
    }

    #[test]
    fn test_dismiss_and_logout_clear_state() {
        let mut editor = logged_in(1, Document::with_root_block(1));
        let uri = editor.open_document().unwrap().meta.uri.clone();

        assert_eq!(
            editor.handle(DocumentDismissed { uri: uri.clone() }.into()),
            Notice::Dismissed(uri)
        );
        assert!(editor.open_document().is_none());

        assert_eq!(editor.handle(LogoutConfirmed.into()), Notice::LoggedOut);
        assert!(editor.user().is_none());
    }
}
