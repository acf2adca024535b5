//! In-memory storage backend

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use livetext_core::{DocumentMeta, DocumentSnapshot, DocumentUri, User, UserId};
use tracing::debug;

use crate::password::{hash_password, new_salt, verify_password};
use crate::{AccountChanges, NewAccount, Storage, StorageError, StorageStats};

struct Account {
    user: User,
    salt: String,
    password_hash: String,
}

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development and tests.
/// Data is lost when the process exits.
pub struct MemoryStorage {
    /// Document data: uri -> (meta, encoded snapshot)
    documents: DashMap<DocumentUri, (DocumentMeta, Vec<u8>)>,
    accounts: DashMap<UserId, Account>,
    usernames: DashMap<String, UserId>,
    next_user_id: AtomicU32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            accounts: DashMap::new(),
            usernames: DashMap::new(),
            next_user_id: AtomicU32::new(1),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_document(
        &self,
        meta: &DocumentMeta,
        snapshot: &DocumentSnapshot,
    ) -> Result<bool, StorageError> {
        let bytes = snapshot
            .encode()
            .map_err(|e| StorageError::create(&meta.uri, e))?;

        match self.documents.entry(meta.uri.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert((meta.clone(), bytes));
                Ok(true)
            }
        }
    }

    async fn save_document(
        &self,
        meta: &DocumentMeta,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), StorageError> {
        let bytes = snapshot
            .encode()
            .map_err(|e| StorageError::write(&meta.uri, e))?;
        self.documents.insert(meta.uri.clone(), (meta.clone(), bytes));
        Ok(())
    }

    async fn load_document(
        &self,
        uri: &DocumentUri,
    ) -> Result<Option<(DocumentMeta, DocumentSnapshot)>, StorageError> {
        match self.documents.get(uri) {
            Some(entry) => {
                let (meta, bytes) = entry.value();
                let snapshot =
                    DocumentSnapshot::decode(bytes).map_err(|e| StorageError::read(uri, e))?;
                Ok(Some((meta.clone(), snapshot)))
            }
            None => Ok(None),
        }
    }

    async fn delete_document(&self, uri: &DocumentUri) -> Result<bool, StorageError> {
        Ok(self.documents.remove(uri).is_some())
    }

    async fn list_documents(
        &self,
        owner: Option<UserId>,
    ) -> Result<Vec<DocumentMeta>, StorageError> {
        let mut metas: Vec<DocumentMeta> = self
            .documents
            .iter()
            .filter(|entry| owner.map_or(true, |o| entry.value().0.owner == o))
            .map(|entry| entry.value().0.clone())
            .collect();
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Option<User>, StorageError> {
        let user_id = match self.usernames.entry(account.username.clone()) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(slot) => {
                let id = self.next_user_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(id);
                id
            }
        };

        let mut user = User::new(user_id, account.username.clone(), account.nickname.clone());
        user.icon = account.icon.clone();

        let salt = new_salt();
        let password_hash = hash_password(&salt, &account.password);
        self.accounts.insert(
            user_id,
            Account {
                user: user.clone(),
                salt,
                password_hash,
            },
        );
        debug!(user_id, username = %account.username, "Account created");
        Ok(Some(user))
    }

    async fn verify_login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, StorageError> {
        let user_id = match self.usernames.get(username) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self
            .accounts
            .get(&user_id)
            .filter(|a| verify_password(&a.salt, password, &a.password_hash))
            .map(|a| a.user.clone()))
    }

    async fn update_account(
        &self,
        user_id: UserId,
        changes: &AccountChanges,
    ) -> Result<Option<User>, StorageError> {
        let mut account = match self.accounts.get_mut(&user_id) {
            Some(account) => account,
            None => return Ok(None),
        };

        if let Some(nickname) = &changes.nickname {
            account.user.nickname = nickname.clone();
        }
        if let Some(icon) = &changes.icon {
            account.user.icon = icon.clone();
        }
        if let Some(password) = &changes.password {
            let salt = new_salt();
            account.password_hash = hash_password(&salt, password);
            account.salt = salt;
        }
        Ok(Some(account.user.clone()))
    }

    async fn add_user_document(
        &self,
        user_id: UserId,
        uri: &DocumentUri,
    ) -> Result<(), StorageError> {
        match self.accounts.get_mut(&user_id) {
            Some(mut account) => {
                account.user.add_document(uri.clone());
                Ok(())
            }
            None => Err(StorageError::write(
                format!("documents of user {}", user_id),
                "unknown user",
            )),
        }
    }

    async fn remove_user_document(
        &self,
        user_id: UserId,
        uri: &DocumentUri,
    ) -> Result<bool, StorageError> {
        Ok(self
            .accounts
            .get_mut(&user_id)
            .map_or(false, |mut account| account.user.remove_document(uri)))
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            document_count: self.documents.len(),
            account_count: self.accounts.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetext_core::Document;

    fn new_account(username: &str) -> NewAccount {
        NewAccount {
            username: username.into(),
            nickname: username.to_uppercase(),
            icon: vec![1, 2, 3],
            password: "secret".into(),
        }
    }

    fn new_document(owner: UserId, name: &str) -> (DocumentMeta, DocumentSnapshot) {
        let uri = DocumentUri::generate("test", name);
        (DocumentMeta::new(uri, name, owner), Document::with_root_block(owner).snapshot())
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let storage = MemoryStorage::new();
        let (meta, snapshot) = new_document(1, "notes");

        assert!(storage.create_document(&meta, &snapshot).await.unwrap());
        assert!(!storage.create_document(&meta, &snapshot).await.unwrap());

        let (loaded_meta, loaded) = storage.load_document(&meta.uri).await.unwrap().unwrap();
        assert_eq!(loaded_meta, meta);
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_delete() {
        let storage = MemoryStorage::new();
        let (meta, snapshot) = new_document(1, "scratch");

        storage.save_document(&meta, &snapshot).await.unwrap();
        assert!(storage.delete_document(&meta.uri).await.unwrap());
        assert!(storage.load_document(&meta.uri).await.unwrap().is_none());
        assert!(!storage.delete_document(&meta.uri).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_owner() {
        let storage = MemoryStorage::new();
        for i in 0..3 {
            let (meta, snapshot) = new_document(1, &format!("a{}", i));
            storage.create_document(&meta, &snapshot).await.unwrap();
        }
        let (meta, snapshot) = new_document(2, "b");
        storage.create_document(&meta, &snapshot).await.unwrap();

        assert_eq!(storage.list_documents(Some(1)).await.unwrap().len(), 3);
        assert_eq!(storage.list_documents(None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_accounts() {
        let storage = MemoryStorage::new();

        let alice = storage.create_account(&new_account("alice")).await.unwrap().unwrap();
        assert!(storage.create_account(&new_account("alice")).await.unwrap().is_none());
        let bob = storage.create_account(&new_account("bob")).await.unwrap().unwrap();
        assert_ne!(alice.user_id, bob.user_id);

        assert_eq!(storage.verify_login("alice", "secret").await.unwrap(), Some(alice.clone()));
        assert!(storage.verify_login("alice", "wrong").await.unwrap().is_none());
        assert!(storage.verify_login("nobody", "secret").await.unwrap().is_none());

        let changes = AccountChanges {
            nickname: Some("Al".into()),
            password: Some("changed".into()),
            ..AccountChanges::default()
        };
        let updated = storage.update_account(alice.user_id, &changes).await.unwrap().unwrap();
        assert_eq!(updated.nickname, "Al");
        assert_eq!(updated.icon, vec![1, 2, 3]);
        assert!(storage.verify_login("alice", "secret").await.unwrap().is_none());
        assert!(storage.verify_login("alice", "changed").await.unwrap().is_some());

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.account_count, 2);
    }

    #[tokio::test]
    async fn test_user_documents() {
        let storage = MemoryStorage::new();
        let alice = storage.create_account(&new_account("alice")).await.unwrap().unwrap();
        let uri = DocumentUri::new("alice:doc:1").unwrap();

        storage.add_user_document(alice.user_id, &uri).await.unwrap();
        storage.add_user_document(alice.user_id, &uri).await.unwrap();
        let user = storage.verify_login("alice", "secret").await.unwrap().unwrap();
        assert_eq!(user.documents, vec![uri.clone()]);

        assert!(storage.remove_user_document(alice.user_id, &uri).await.unwrap());
        assert!(!storage.remove_user_document(alice.user_id, &uri).await.unwrap());
        assert!(storage.add_user_document(999, &uri).await.is_err());
    }
}
