//! Client sessions

use livetext_core::{DocumentUri, User};
use livetext_protocol::Message;
use tokio::sync::mpsc;
use tracing::trace;

use crate::workspace::WorkspaceHandle;

/// Unique id of a connection for the lifetime of the server
pub type SessionId = u64;

/// Cloneable outbound side of a session.
///
/// Messages are queued on an unbounded channel drained by the connection's writer task,
/// so senders never wait on a slow client.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<Message>,
}

impl SessionHandle {
    pub fn new(id: SessionId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a message; returns false once the connection is gone
    pub fn send(&self, message: impl Into<Message>) -> bool {
        let message = message.into();
        trace!(session = self.id, message = message.name(), "Queue outbound");
        self.tx.send(message).is_ok()
    }
}

/// A document the session is attached to
#[derive(Debug, Clone)]
pub struct AttachedDocument {
    pub uri: DocumentUri,
    pub workspace: WorkspaceHandle,
}

/// Per-connection state
#[derive(Debug)]
pub struct ClientSession {
    pub handle: SessionHandle,
    /// Logged-in account
    pub user: Option<User>,
    pub document: Option<AttachedDocument>,
}

impl ClientSession {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            user: None,
            document: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }
}
