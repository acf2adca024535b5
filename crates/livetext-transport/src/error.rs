//! Transport error types

use livetext_core::DocumentUri;
use livetext_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The workspace task stopped before answering
    #[error("Workspace for {0} is gone")]
    WorkspaceGone(DocumentUri),

    #[error("Document unavailable: {0}")]
    DocumentUnavailable(String),
}
