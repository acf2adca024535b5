//! LiveText Storage Backends
//!
//! Persists documents (metadata plus snapshot) and user accounts:
//! - Memory (default): Fast, volatile storage
//! - SQLite: Embedded persistence

pub mod memory;
pub mod password;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use livetext_core::{DocumentMeta, DocumentSnapshot, DocumentUri, User, UserId};

/// Storage backend trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store a new document. Returns false if the URI is already taken.
    async fn create_document(
        &self,
        meta: &DocumentMeta,
        snapshot: &DocumentSnapshot,
    ) -> Result<bool, StorageError>;

    /// Overwrite the stored state of a document
    async fn save_document(
        &self,
        meta: &DocumentMeta,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), StorageError>;

    /// Load a document
    async fn load_document(
        &self,
        uri: &DocumentUri,
    ) -> Result<Option<(DocumentMeta, DocumentSnapshot)>, StorageError>;

    /// Delete a document
    async fn delete_document(&self, uri: &DocumentUri) -> Result<bool, StorageError>;

    /// List document metadata, optionally restricted to one owner
    async fn list_documents(
        &self,
        owner: Option<UserId>,
    ) -> Result<Vec<DocumentMeta>, StorageError>;

    /// Register an account. Returns `None` if the username is taken.
    async fn create_account(&self, account: &NewAccount) -> Result<Option<User>, StorageError>;

    /// Check credentials and return the account on success
    async fn verify_login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, StorageError>;

    /// Apply a partial profile update. Returns `None` for an unknown user.
    async fn update_account(
        &self,
        user_id: UserId,
        changes: &AccountChanges,
    ) -> Result<Option<User>, StorageError>;

    /// Add a document to a user's list
    async fn add_user_document(
        &self,
        user_id: UserId,
        uri: &DocumentUri,
    ) -> Result<(), StorageError>;

    /// Remove a document from a user's list
    async fn remove_user_document(
        &self,
        user_id: UserId,
        uri: &DocumentUri,
    ) -> Result<bool, StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to open storage: {0}")]
    Open(String),

    #[error("Failed to create {what}: {cause}")]
    Create { what: String, cause: String },

    #[error("Failed to read {what}: {cause}")]
    Read { what: String, cause: String },

    #[error("Failed to write {what}: {cause}")]
    Write { what: String, cause: String },
}

impl StorageError {
    pub(crate) fn create(what: impl std::fmt::Display, cause: impl std::fmt::Display) -> Self {
        StorageError::Create { what: what.to_string(), cause: cause.to_string() }
    }

    pub(crate) fn read(what: impl std::fmt::Display, cause: impl std::fmt::Display) -> Self {
        StorageError::Read { what: what.to_string(), cause: cause.to_string() }
    }

    pub(crate) fn write(what: impl std::fmt::Display, cause: impl std::fmt::Display) -> Self {
        StorageError::Write { what: what.to_string(), cause: cause.to_string() }
    }
}

/// Registration request
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub nickname: String,
    pub icon: Vec<u8>,
    pub password: String,
}

/// Partial account update; `None` fields stay unchanged
#[derive(Debug, Clone, Default)]
pub struct AccountChanges {
    pub nickname: Option<String>,
    pub icon: Option<Vec<u8>>,
    pub password: Option<String>,
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub document_count: usize,
    pub account_count: usize,
}

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
