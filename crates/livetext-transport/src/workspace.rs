//! Document workspaces
//!
//! A workspace is the single writer of one open document. It runs as a task consuming a
//! bounded mailbox, applies edits in arrival order, relays their canonical effect to the
//! other editors and persists the document periodically and once more before it closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use livetext_core::{Document, DocumentMeta, DocumentSnapshot, DocumentUri, Position, User, UserId};
use livetext_protocol::{
    BlockEdit, CharsDelete, CharsFormat, CharsInsert, CursorMove, DocumentReady, ListEdit, Message,
    ProfileUpdate, UserJoin, UserLeave,
};
use livetext_storage::{Storage, StorageError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::registry::SessionRegistry;
use crate::session::{SessionHandle, SessionId};

/// Workspace tuning
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Period of the save timer
    pub save_interval: Duration,
    /// Mailbox capacity
    pub mailbox_capacity: usize,
    /// Attempts at the final save before the workspace gives up
    pub final_save_attempts: u32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_millis(5000),
            mailbox_capacity: 256,
            final_save_attempts: 3,
        }
    }
}

/// Lifecycle of a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceState {
    Loading,
    Active,
    Saving,
    Closing,
}

pub(crate) enum Command {
    Join {
        session: SessionHandle,
        user: User,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Leave {
        session: SessionId,
        /// Set when this was the last attached session
        close: Option<watch::Sender<bool>>,
    },
    Edit {
        session: SessionId,
        message: Message,
    },
    Cursor {
        session: SessionId,
        position: Option<Position>,
    },
    Profile {
        session: SessionId,
        user: User,
    },
    Snapshot {
        reply: oneshot::Sender<(DocumentMeta, DocumentSnapshot)>,
    },
}

/// Address of a running workspace
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    uri: DocumentUri,
    generation: u64,
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Join { session, .. } => write!(f, "Join({})", session.id()),
            Command::Leave { session, close } => {
                write!(f, "Leave({}, last={})", session, close.is_some())
            }
            Command::Edit { session, message } => {
                write!(f, "Edit({}, {})", session, message.name())
            }
            Command::Cursor { session, .. } => write!(f, "Cursor({})", session),
            Command::Profile { session, .. } => write!(f, "Profile({})", session),
            Command::Snapshot { .. } => write!(f, "Snapshot"),
        }
    }
}

impl WorkspaceHandle {
    pub fn uri(&self) -> &DocumentUri {
        &self.uri
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn send(&self, command: Command) -> Result<(), TransportError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| TransportError::WorkspaceGone(self.uri.clone()))
    }

    /// Attach a session. The session receives `DocumentReady` before any other document traffic.
    pub async fn join(&self, session: SessionHandle, user: User) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Join { session, user, reply }).await?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(TransportError::DocumentUnavailable(reason)),
            Err(_) => Err(TransportError::WorkspaceGone(self.uri.clone())),
        }
    }

    /// Detach a session. Returns false if the workspace is already gone.
    pub(crate) async fn leave(
        &self,
        session: SessionId,
        close: Option<watch::Sender<bool>>,
    ) -> bool {
        self.send(Command::Leave { session, close }).await.is_ok()
    }

    pub async fn edit(&self, session: SessionId, message: Message) -> Result<(), TransportError> {
        self.send(Command::Edit { session, message }).await
    }

    pub async fn cursor(
        &self,
        session: SessionId,
        position: Option<Position>,
    ) -> Result<(), TransportError> {
        self.send(Command::Cursor { session, position }).await
    }

    pub async fn profile_changed(
        &self,
        session: SessionId,
        user: User,
    ) -> Result<(), TransportError> {
        self.send(Command::Profile { session, user }).await
    }

    /// Current metadata and document image
    pub async fn snapshot(&self) -> Result<(DocumentMeta, DocumentSnapshot), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| TransportError::WorkspaceGone(self.uri.clone()))
    }
}

struct Editor {
    session: SessionHandle,
    user_id: UserId,
    nickname: String,
    icon: Vec<u8>,
}

impl Editor {
    fn presence(&self) -> UserJoin {
        UserJoin {
            user_id: self.user_id,
            nickname: self.nickname.clone(),
            icon: self.icon.clone(),
        }
    }
}

type SaveResult = (u64, Result<(), StorageError>);

/// The actor state of one open document
pub struct Workspace {
    uri: DocumentUri,
    generation: u64,
    meta: Option<DocumentMeta>,
    document: Document,
    editors: HashMap<SessionId, Editor>,
    state: WorkspaceState,
    saved_version: u64,
    storage: Arc<dyn Storage>,
    registry: Arc<SessionRegistry>,
    config: WorkspaceConfig,
    save_tx: mpsc::UnboundedSender<SaveResult>,
}

impl Workspace {
    /// Start the workspace task for `uri`; it loads the document before serving its mailbox
    pub(crate) fn spawn(
        uri: DocumentUri,
        generation: u64,
        registry: Arc<SessionRegistry>,
        storage: Arc<dyn Storage>,
        config: WorkspaceConfig,
    ) -> WorkspaceHandle {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (save_tx, save_rx) = mpsc::unbounded_channel();

        let workspace = Workspace {
            uri: uri.clone(),
            generation,
            meta: None,
            document: Document::new(),
            editors: HashMap::new(),
            state: WorkspaceState::Loading,
            saved_version: 0,
            storage,
            registry,
            config,
            save_tx,
        };
        tokio::spawn(workspace.run(rx, save_rx));

        WorkspaceHandle { uri, generation, tx }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        mut save_rx: mpsc::UnboundedReceiver<SaveResult>,
    ) {
        if let Err(reason) = self.load().await {
            self.fail(rx, reason).await;
            return;
        }

        let mut ticker = tokio::time::interval(self.config.save_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let close = loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => {
                        if let Some(close) = self.handle(command) {
                            break Some(close);
                        }
                    }
                    None => break None,
                },
                _ = ticker.tick() => self.start_save(),
                Some((version, result)) = save_rx.recv() => self.finish_save(version, result),
            }
        };

        self.close(&mut save_rx, close).await;
    }

    async fn load(&mut self) -> Result<(), String> {
        let (meta, snapshot) = match self.storage.load_document(&self.uri).await {
            Ok(Some(found)) => found,
            Ok(None) => return Err(format!("Document {} does not exist", self.uri)),
            Err(e) => return Err(e.to_string()),
        };
        self.document = Document::from_snapshot(snapshot).map_err(|e| e.to_string())?;
        self.saved_version = meta.version;
        self.meta = Some(meta);
        self.state = WorkspaceState::Active;
        info!(uri = %self.uri, symbols = self.document.len(), "Workspace loaded");
        Ok(())
    }

    /// Retire after a failed load and turn away everyone already queued
    async fn fail(self, mut rx: mpsc::Receiver<Command>, reason: String) {
        warn!(uri = %self.uri, reason = %reason, "Workspace failed to load");
        self.registry.retire(&self.uri, self.generation);
        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                Command::Join { reply, .. } => {
                    let _ = reply.send(Err(reason.clone()));
                }
                Command::Leave { close: Some(done), .. } => {
                    let _ = done.send(true);
                }
                _ => {}
            }
        }
    }

    /// Apply one command. Returns the close signal when the last editor left.
    fn handle(&mut self, command: Command) -> Option<watch::Sender<bool>> {
        match command {
            Command::Join { session, user, reply } => {
                self.join(session, user);
                let _ = reply.send(Ok(()));
            }
            Command::Leave { session, close } => {
                self.leave(session);
                if close.is_some() {
                    if !self.editors.is_empty() {
                        let editors = self.editors.len();
                        warn!(uri = %self.uri, editors, "Closing with editors attached");
                    }
                    return close;
                }
            }
            Command::Edit { session, message } => self.edit(session, message),
            Command::Cursor { session, position } => {
                if let Some(editor) = self.editors.get(&session) {
                    let moved = CursorMove {
                        user_id: editor.user_id,
                        position,
                    };
                    self.broadcast(session, moved.into());
                }
            }
            Command::Profile { session, user } => {
                if let Some(editor) = self.editors.get_mut(&session) {
                    editor.nickname = user.nickname.clone();
                    editor.icon = user.icon.clone();
                    let update = ProfileUpdate {
                        user_id: user.user_id,
                        nickname: user.nickname,
                        icon: user.icon,
                    };
                    self.broadcast(session, update.into());
                }
            }
            Command::Snapshot { reply } => {
                if let Some(meta) = &self.meta {
                    let _ = reply.send((meta.clone(), self.document.snapshot()));
                }
            }
        }
        None
    }

    fn join(&mut self, session: SessionHandle, user: User) {
        let Some(meta) = &self.meta else { return };

        session.send(DocumentReady {
            meta: meta.clone(),
            snapshot: self.document.snapshot(),
        });

        let editor = Editor {
            session,
            user_id: user.user_id,
            nickname: user.nickname,
            icon: user.icon,
        };
        for other in self.editors.values() {
            editor.session.send(other.presence());
            other.session.send(editor.presence());
        }

        info!(
            uri = %self.uri,
            session = editor.session.id(),
            user_id = editor.user_id,
            "Editor joined"
        );
        self.editors.insert(editor.session.id(), editor);
    }

    fn leave(&mut self, session: SessionId) {
        if let Some(editor) = self.editors.remove(&session) {
            info!(uri = %self.uri, session, user_id = editor.user_id, "Editor left");
            self.broadcast(session, UserLeave { user_id: editor.user_id }.into());
        }
    }

    fn edit(&mut self, session: SessionId, message: Message) {
        let Some(author) = self.editors.get(&session).map(|e| e.user_id) else {
            warn!(uri = %self.uri, session, "Edit from a session that is not attached");
            return;
        };

        if let Some(effect) = self.apply(author, message) {
            if let Some(meta) = self.meta.as_mut() {
                meta.touch();
            }
            self.broadcast(session, effect);
        }
    }

    /// Apply an edit and return the part of it that changed the document
    fn apply(&mut self, author: UserId, message: Message) -> Option<Message> {
        let doc = &mut self.document;

        match message {
            Message::CharsInsert(CharsInsert {
                symbols,
                block,
                block_format,
            }) => {
                if symbols.iter().any(|s| doc.index_of(&s.position).is_none()) {
                    doc.ensure_block(block, block_format.clone());
                }
                let mut applied = Vec::with_capacity(symbols.len());
                for mut symbol in symbols {
                    symbol.author = author;
                    match doc.insert(symbol.clone()) {
                        Ok(_) => applied.push(symbol),
                        Err(e) => debug!(uri = %self.uri, error = %e, "Insert skipped"),
                    }
                }
                (!applied.is_empty()).then(|| {
                    CharsInsert {
                        symbols: applied,
                        block,
                        block_format,
                    }
                    .into()
                })
            }
            Message::CharsDelete(CharsDelete { positions }) => {
                let removed: Vec<Position> = positions
                    .into_iter()
                    .filter(|p| doc.remove_at_position(p).is_some())
                    .collect();
                (!removed.is_empty()).then(|| CharsDelete { positions: removed }.into())
            }
            Message::CharsFormat(CharsFormat { positions, formats }) => {
                let mut applied = CharsFormat {
                    positions: Vec::new(),
                    formats: Vec::new(),
                };
                for (position, format) in positions.into_iter().zip(formats) {
                    if doc.format_symbol(&position, format.clone()).is_some() {
                        applied.positions.push(position);
                        applied.formats.push(format);
                    }
                }
                (!applied.positions.is_empty()).then(|| applied.into())
            }
            Message::BlockEdit(BlockEdit { block, format }) => {
                match doc.format_block(&block, format.clone()) {
                    Ok(_) => Some(BlockEdit { block, format }.into()),
                    Err(e) => {
                        debug!(uri = %self.uri, error = %e, "Block edit dropped");
                        None
                    }
                }
            }
            Message::ListEdit(ListEdit { block, list, format }) => {
                match doc.edit_block_list(block, list, format) {
                    Ok(()) => Some(ListEdit { block, list, format }.into()),
                    Err(e) => {
                        debug!(uri = %self.uri, error = %e, "List edit dropped");
                        None
                    }
                }
            }
            other => {
                warn!(uri = %self.uri, message = other.name(), "Not an edit");
                None
            }
        }
    }

    /// Send to every editor except `from`
    fn broadcast(&self, from: SessionId, message: Message) {
        for (id, editor) in &self.editors {
            if *id != from && !editor.session.send(message.clone()) {
                debug!(uri = %self.uri, session = id, "Editor connection already closed");
            }
        }
    }

    fn dirty(&self) -> bool {
        self.meta.as_ref().map_or(false, |m| m.version > self.saved_version)
    }

    /// Persist a snapshot off the workspace task if anything changed since the last save
    fn start_save(&mut self) {
        if self.state != WorkspaceState::Active || !self.dirty() {
            return;
        }
        let Some(meta) = self.meta.clone() else { return };

        self.state = WorkspaceState::Saving;
        let snapshot = self.document.snapshot();
        let storage = self.storage.clone();
        let done = self.save_tx.clone();

        tokio::spawn(async move {
            let result = storage.save_document(&meta, &snapshot).await;
            let _ = done.send((meta.version, result));
        });
    }

    fn finish_save(&mut self, version: u64, result: Result<(), StorageError>) {
        if self.state == WorkspaceState::Saving {
            self.state = WorkspaceState::Active;
        }
        match result {
            Ok(()) => {
                self.saved_version = self.saved_version.max(version);
                debug!(uri = %self.uri, version, "Document saved");
            }
            Err(e) => warn!(uri = %self.uri, error = %e, "Save failed, retrying on next tick"),
        }
    }

    async fn close(
        mut self,
        save_rx: &mut mpsc::UnboundedReceiver<SaveResult>,
        done: Option<watch::Sender<bool>>,
    ) {
        if self.state == WorkspaceState::Saving {
            if let Some((version, result)) = save_rx.recv().await {
                self.finish_save(version, result);
            }
        }
        self.state = WorkspaceState::Closing;

        let mut attempts = 0;
        while self.dirty() {
            let Some(meta) = self.meta.clone() else { break };
            match self.storage.save_document(&meta, &self.document.snapshot()).await {
                Ok(()) => self.saved_version = meta.version,
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.final_save_attempts {
                        error!(
                            uri = %self.uri,
                            error = %e,
                            "Final save failed, unsaved changes are lost"
                        );
                        break;
                    }
                    warn!(
                        uri = %self.uri,
                        error = %e,
                        attempt = attempts,
                        "Final save failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempts))).await;
                }
            }
        }

        self.registry.retire(&self.uri, self.generation);
        if let Some(done) = done {
            let _ = done.send(true);
        }
        info!(uri = %self.uri, "Workspace closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use livetext_core::{BlockFormat, CharFormat, Symbol, TextBlockId};
    use livetext_storage::{AccountChanges, MemoryStorage, NewAccount, StorageStats};
    use tokio::sync::mpsc::error::TryRecvError;

    /// Memory storage whose first `failures` saves fail and whose saves take `delay`
    struct FlakyStorage {
        inner: MemoryStorage,
        failures: AtomicU32,
        saves: AtomicU32,
        delay: Duration,
    }

    impl FlakyStorage {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStorage::new(),
                failures: AtomicU32::new(failures),
                saves: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(0)
            }
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn create_document(
            &self,
            meta: &DocumentMeta,
            snapshot: &DocumentSnapshot,
        ) -> Result<bool, StorageError> {
            self.inner.create_document(meta, snapshot).await
        }

        async fn save_document(
            &self,
            meta: &DocumentMeta,
            snapshot: &DocumentSnapshot,
        ) -> Result<(), StorageError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StorageError::Write {
                    what: meta.uri.to_string(),
                    cause: "disk full".into(),
                });
            }
            self.inner.save_document(meta, snapshot).await
        }

        async fn load_document(
            &self,
            uri: &DocumentUri,
        ) -> Result<Option<(DocumentMeta, DocumentSnapshot)>, StorageError> {
            self.inner.load_document(uri).await
        }

        async fn delete_document(&self, uri: &DocumentUri) -> Result<bool, StorageError> {
            self.inner.delete_document(uri).await
        }

        async fn list_documents(
            &self,
            owner: Option<UserId>,
        ) -> Result<Vec<DocumentMeta>, StorageError> {
            self.inner.list_documents(owner).await
        }

        async fn create_account(&self, account: &NewAccount) -> Result<Option<User>, StorageError> {
            self.inner.create_account(account).await
        }

        async fn verify_login(
            &self,
            username: &str,
            password: &str,
        ) -> Result<Option<User>, StorageError> {
            self.inner.verify_login(username, password).await
        }

        async fn update_account(
            &self,
            user_id: UserId,
            changes: &AccountChanges,
        ) -> Result<Option<User>, StorageError> {
            self.inner.update_account(user_id, changes).await
        }

        async fn add_user_document(
            &self,
            user_id: UserId,
            uri: &DocumentUri,
        ) -> Result<(), StorageError> {
            self.inner.add_user_document(user_id, uri).await
        }

        async fn remove_user_document(
            &self,
            user_id: UserId,
            uri: &DocumentUri,
        ) -> Result<bool, StorageError> {
            self.inner.remove_user_document(user_id, uri).await
        }

        async fn stats(&self) -> Result<StorageStats, StorageError> {
            self.inner.stats().await
        }
    }

    const ROOT: TextBlockId = TextBlockId { counter: 0, author: 1 };

    async fn setup(
        storage: Arc<dyn Storage>,
        config: WorkspaceConfig,
    ) -> (Arc<SessionRegistry>, DocumentUri) {
        let uri = DocumentUri::generate("owner", "doc");
        let meta = DocumentMeta::new(uri.clone(), "doc", 1);
        storage
            .create_document(&meta, &Document::with_root_block(1).snapshot())
            .await
            .unwrap();
        (SessionRegistry::new(storage, config), uri)
    }

    async fn attach(
        registry: &Arc<SessionRegistry>,
        uri: &DocumentUri,
        id: SessionId,
    ) -> (WorkspaceHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let user = User::new(id as UserId, format!("user{}", id), format!("User {}", id));
        let handle = registry.attach(uri, SessionHandle::new(id, tx), user).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Message::DocumentReady(_))));
        (handle, rx)
    }

    fn insert_first(doc: &mut Document, ch: char, site: UserId) -> Message {
        let position = doc.fractional_pos_begin(site).unwrap();
        CharsInsert {
            symbols: vec![Symbol::new(ch, CharFormat::default(), site, position, ROOT)],
            block: ROOT,
            block_format: BlockFormat::default(),
        }
        .into()
    }

    async fn wait_closed(registry: &SessionRegistry) {
        while registry.open_documents() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_not_rebroadcast() {
        let storage = Arc::new(MemoryStorage::new());
        let (registry, uri) = setup(storage, WorkspaceConfig::default()).await;
        let (ws, mut rx_a) = attach(&registry, &uri, 1).await;
        let (_, mut rx_b) = attach(&registry, &uri, 2).await;
        assert!(matches!(rx_a.recv().await, Some(Message::UserJoin(_))));
        assert!(matches!(rx_b.recv().await, Some(Message::UserJoin(_))));

        let insert = insert_first(&mut Document::with_root_block(1), 'x', 1);
        ws.edit(1, insert.clone()).await.unwrap();
        ws.edit(1, insert).await.unwrap();
        let (meta, snapshot) = ws.snapshot().await.unwrap();

        assert!(matches!(rx_b.recv().await, Some(Message::CharsInsert(_))));
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(rx_a.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(snapshot.symbols.len(), 1);
        assert_eq!(meta.version, 2);
    }

    #[tokio::test]
    async fn test_unknown_block_edit_is_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let (registry, uri) = setup(storage, WorkspaceConfig::default()).await;
        let (ws, _rx_a) = attach(&registry, &uri, 1).await;
        let (_, mut rx_b) = attach(&registry, &uri, 2).await;
        assert!(matches!(rx_b.recv().await, Some(Message::UserJoin(_))));

        let edit = BlockEdit {
            block: TextBlockId::new(42, 9),
            format: BlockFormat::default(),
        };
        ws.edit(1, edit.into()).await.unwrap();
        let (meta, _) = ws.snapshot().await.unwrap();

        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(meta.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_save() {
        let storage = Arc::new(MemoryStorage::new());
        let config = WorkspaceConfig {
            save_interval: Duration::from_millis(100),
            ..WorkspaceConfig::default()
        };
        let (registry, uri) = setup(storage.clone(), config).await;
        let (ws, _rx) = attach(&registry, &uri, 1).await;

        ws.edit(1, insert_first(&mut Document::with_root_block(1), 'x', 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let (meta, snapshot) = storage.load_document(&uri).await.unwrap().unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(snapshot.symbols.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_save_reaches_next_save() {
        let storage = Arc::new(FlakyStorage::slow(Duration::from_millis(150)));
        let config = WorkspaceConfig {
            save_interval: Duration::from_millis(100),
            ..WorkspaceConfig::default()
        };
        let (registry, uri) = setup(storage.clone(), config).await;
        let (ws, _rx) = attach(&registry, &uri, 1).await;
        let mut replica = Document::with_root_block(1);

        ws.edit(1, insert_first(&mut replica, 'x', 1)).await.unwrap();
        // The first save starts at 100ms and completes at 250ms.
        tokio::time::sleep(Duration::from_millis(120)).await;
        ws.edit(1, insert_first(&mut replica, 'y', 1)).await.unwrap();
        let (meta, _) = ws.snapshot().await.unwrap();
        assert_eq!(meta.version, 3);

        tokio::time::sleep(Duration::from_millis(140)).await;
        let (meta, snapshot) = storage.load_document(&uri).await.unwrap().unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(snapshot.symbols.len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let (meta, snapshot) = storage.load_document(&uri).await.unwrap().unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(snapshot.symbols.len(), 2);
        assert_eq!(storage.saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_periodic_save_retried_on_next_tick() {
        let storage = Arc::new(FlakyStorage::new(1));
        let config = WorkspaceConfig {
            save_interval: Duration::from_millis(100),
            ..WorkspaceConfig::default()
        };
        let (registry, uri) = setup(storage.clone(), config).await;
        let (ws, _rx) = attach(&registry, &uri, 1).await;

        ws.edit(1, insert_first(&mut Document::with_root_block(1), 'x', 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(storage.saves.load(Ordering::SeqCst), 1);
        let (meta, snapshot) = storage.load_document(&uri).await.unwrap().unwrap();
        assert_eq!(meta.version, 1);
        assert!(snapshot.symbols.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.saves.load(Ordering::SeqCst), 2);
        let (meta, snapshot) = storage.load_document(&uri).await.unwrap().unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(snapshot.symbols.len(), 1);
        let (_, live) = ws.snapshot().await.unwrap();
        assert_eq!(live.symbols, snapshot.symbols);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_save_retries_until_stored() {
        let storage = Arc::new(FlakyStorage::new(2));
        let config = WorkspaceConfig {
            save_interval: Duration::from_secs(3600),
            ..WorkspaceConfig::default()
        };
        let (registry, uri) = setup(storage.clone(), config).await;
        let (ws, _rx) = attach(&registry, &uri, 1).await;

        ws.edit(1, insert_first(&mut Document::with_root_block(1), 'x', 1)).await.unwrap();
        registry.detach(&ws, 1).await;
        wait_closed(&registry).await;

        assert_eq!(storage.saves.load(Ordering::SeqCst), 3);
        let (_, snapshot) = storage.load_document(&uri).await.unwrap().unwrap();
        assert_eq!(snapshot.symbols.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_save_gives_up_and_closes() {
        let storage = Arc::new(FlakyStorage::new(u32::MAX));
        let config = WorkspaceConfig {
            save_interval: Duration::from_secs(3600),
            final_save_attempts: 3,
            ..WorkspaceConfig::default()
        };
        let (registry, uri) = setup(storage.clone(), config).await;
        let (ws, _rx) = attach(&registry, &uri, 1).await;

        ws.edit(1, insert_first(&mut Document::with_root_block(1), 'x', 1)).await.unwrap();
        registry.detach(&ws, 1).await;
        wait_closed(&registry).await;

        assert_eq!(storage.saves.load(Ordering::SeqCst), 3);
        let (_, snapshot) = storage.load_document(&uri).await.unwrap().unwrap();
        assert!(snapshot.symbols.is_empty());
    }
}
