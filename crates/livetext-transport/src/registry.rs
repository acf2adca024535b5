//! Session registry
//!
//! Cross-document state behind one coarse lock: which users are logged in, and which
//! documents have a live workspace together with the number of sessions attached to it.
//! The lock only guards membership bookkeeping and is never held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use livetext_core::{DocumentUri, User, UserId};
use livetext_storage::Storage;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::session::{SessionHandle, SessionId};
use crate::workspace::{Workspace, WorkspaceConfig, WorkspaceHandle};

enum Slot {
    Open {
        handle: WorkspaceHandle,
        sessions: usize,
    },
    /// Last session left; the workspace is flushing to storage
    Closing {
        generation: u64,
        done: watch::Receiver<bool>,
    },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Slot::Open { handle, .. } => handle.generation(),
            Slot::Closing { generation, .. } => *generation,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    users: HashMap<UserId, SessionId>,
    slots: HashMap<DocumentUri, Slot>,
    next_generation: u64,
}

enum Route {
    Join(WorkspaceHandle),
    Wait(u64, watch::Receiver<bool>),
}

/// Logged-in users and live workspaces
pub struct SessionRegistry {
    inner: Mutex<RegistryState>,
    storage: Arc<dyn Storage>,
    config: WorkspaceConfig,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn Storage>, config: WorkspaceConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryState::default()),
            storage,
            config,
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Claim the user for a session. Fails if another session holds it.
    pub fn login(&self, user_id: UserId, session: SessionId) -> bool {
        let mut state = self.inner.lock();
        match state.users.get(&user_id) {
            Some(holder) if *holder != session => false,
            _ => {
                state.users.insert(user_id, session);
                true
            }
        }
    }

    /// Release the user if this session holds it
    pub fn logout(&self, user_id: UserId, session: SessionId) {
        let mut state = self.inner.lock();
        if state.users.get(&user_id) == Some(&session) {
            state.users.remove(&user_id);
        }
    }

    pub fn is_logged_in(&self, user_id: UserId) -> bool {
        self.inner.lock().users.contains_key(&user_id)
    }

    /// Number of documents with a live workspace
    pub fn open_documents(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Attach a session to the workspace of `uri`, starting one if needed.
    ///
    /// If the previous workspace of the document is still closing, waits for its final save
    /// so the new workspace loads the latest state.
    pub async fn attach(
        self: &Arc<Self>,
        uri: &DocumentUri,
        session: SessionHandle,
        user: User,
    ) -> Result<WorkspaceHandle, TransportError> {
        loop {
            let route = {
                let mut guard = self.inner.lock();
                let state = &mut *guard;
                match state.slots.get_mut(uri) {
                    Some(Slot::Open { handle, sessions }) => {
                        *sessions += 1;
                        Route::Join(handle.clone())
                    }
                    Some(Slot::Closing { generation, done }) => {
                        Route::Wait(*generation, done.clone())
                    }
                    None => {
                        let generation = state.next_generation;
                        state.next_generation += 1;
                        let handle = Workspace::spawn(
                            uri.clone(),
                            generation,
                            self.clone(),
                            self.storage.clone(),
                            self.config.clone(),
                        );
                        debug!(uri = %uri, generation, "Workspace started");
                        state.slots.insert(
                            uri.clone(),
                            Slot::Open {
                                handle: handle.clone(),
                                sessions: 1,
                            },
                        );
                        Route::Join(handle)
                    }
                }
            };

            match route {
                Route::Wait(generation, mut done) => {
                    debug!(uri = %uri, session = session.id(), "Waiting for closing workspace");
                    if done.wait_for(|closed| *closed).await.is_err() {
                        // The workspace died without signalling; drop its slot.
                        self.retire(uri, generation);
                    }
                }
                Route::Join(handle) => {
                    return match handle.join(session, user).await {
                        Ok(()) => Ok(handle),
                        Err(e) => {
                            self.retire(uri, handle.generation());
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Detach a session. The last session to leave starts the workspace's close.
    pub async fn detach(&self, workspace: &WorkspaceHandle, session: SessionId) {
        let uri = workspace.uri();
        let close = {
            let mut state = self.inner.lock();
            let remaining = match state.slots.get_mut(uri) {
                Some(Slot::Open { handle, sessions })
                    if handle.generation() == workspace.generation() =>
                {
                    *sessions = sessions.saturating_sub(1);
                    Some(*sessions)
                }
                _ => None,
            };
            match remaining {
                Some(0) => {
                    let (tx, rx) = watch::channel(false);
                    state.slots.insert(
                        uri.clone(),
                        Slot::Closing {
                            generation: workspace.generation(),
                            done: rx,
                        },
                    );
                    Some(tx)
                }
                _ => None,
            }
        };

        let last = close.is_some();
        if !workspace.leave(session, close).await && last {
            self.retire(uri, workspace.generation());
        }
    }

    /// Forget the slot of a workspace that closed or failed, if it is still the current one
    pub(crate) fn retire(&self, uri: &DocumentUri, generation: u64) {
        let mut state = self.inner.lock();
        if state.slots.get(uri).map(Slot::generation) == Some(generation) {
            state.slots.remove(uri);
            info!(uri = %uri, generation, "Workspace retired");
        }
    }
}
