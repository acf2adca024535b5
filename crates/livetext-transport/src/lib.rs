//! LiveText Transport Layer
//!
//! Connects clients to shared documents:
//! - TCP: framed connections, one session per connection
//! - Handler: routes decoded messages to accounts, documents and workspaces
//! - Registry: logged-in users and the live workspace of each open document
//! - Workspace: single-writer actor owning one document while it has editors

pub mod error;
pub mod handler;
pub mod registry;
pub mod session;
pub mod tcp;
pub mod workspace;

pub use error::TransportError;
pub use handler::MessageHandler;
pub use registry::SessionRegistry;
pub use session::{ClientSession, SessionHandle, SessionId};
pub use tcp::{ServerConfig, TcpServer};
pub use workspace::{WorkspaceConfig, WorkspaceHandle, WorkspaceState};
