//! Startup failures. Each one is fatal and reported before any session is accepted.

use std::net::SocketAddr;
use std::path::PathBuf;

use livetext_storage::StorageError;
use livetext_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage unavailable at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: TransportError,
    },
}
