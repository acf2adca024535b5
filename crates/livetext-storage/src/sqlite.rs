//! SQLite storage backend

use std::path::Path;

use async_trait::async_trait;
use livetext_core::{DocumentMeta, DocumentSnapshot, DocumentUri, User, UserId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::password::{hash_password, new_salt, verify_password};
use crate::{AccountChanges, NewAccount, Storage, StorageError, StorageStats};

/// SQLite storage backend
///
/// Embedded persistence for single-node deployments. Metadata is stored as JSON,
/// snapshots as MessagePack blobs.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| StorageError::Open(format!("{}: {}", path.display(), e)))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        info!(path = %path.display(), "SQLite storage opened");
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Open(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                uri TEXT PRIMARY KEY,
                owner INTEGER NOT NULL,
                meta TEXT NOT NULL,
                snapshot BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner);

            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                nickname TEXT NOT NULL,
                icon BLOB NOT NULL,
                salt TEXT NOT NULL,
                password_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_documents (
                user_id INTEGER NOT NULL REFERENCES users(user_id),
                uri TEXT NOT NULL,
                PRIMARY KEY (user_id, uri)
            );
            "#,
        )
        .map_err(|e| StorageError::Open(format!("schema: {}", e)))?;

        Ok(())
    }

    fn load_user(conn: &Connection, user_id: UserId) -> Result<Option<User>, StorageError> {
        let what = || format!("user {}", user_id);

        let row: Option<(String, String, Vec<u8>)> = conn
            .query_row(
                "SELECT username, nickname, icon FROM users WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| StorageError::read(what(), e))?;

        let (username, nickname, icon) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let mut stmt = conn
            .prepare("SELECT uri FROM user_documents WHERE user_id = ?1 ORDER BY rowid")
            .map_err(|e| StorageError::read(what(), e))?;
        let documents: Vec<DocumentUri> = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::read(what(), e))?
            .filter_map(|r| r.ok())
            .filter_map(|uri| DocumentUri::new(uri).ok())
            .collect();

        let mut user = User::new(user_id, username, nickname);
        user.icon = icon;
        user.documents = documents;
        Ok(Some(user))
    }

    fn encode(
        meta: &DocumentMeta,
        snapshot: &DocumentSnapshot,
    ) -> Result<(String, Vec<u8>), StorageError> {
        let meta_json = serde_json::to_string(meta).map_err(|e| StorageError::write(&meta.uri, e))?;
        let blob = snapshot.encode().map_err(|e| StorageError::write(&meta.uri, e))?;
        Ok((meta_json, blob))
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_document(
        &self,
        meta: &DocumentMeta,
        snapshot: &DocumentSnapshot,
    ) -> Result<bool, StorageError> {
        let (meta_json, blob) = Self::encode(meta, snapshot)?;
        let conn = self.conn.lock();

        let affected = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO documents (uri, owner, meta, snapshot, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![meta.uri.as_str(), meta.owner, meta_json, blob, meta.updated_at as i64],
            )
            .map_err(|e| StorageError::create(&meta.uri, e))?;

        Ok(affected == 1)
    }

    async fn save_document(
        &self,
        meta: &DocumentMeta,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), StorageError> {
        let (meta_json, blob) = Self::encode(meta, snapshot)?;
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO documents (uri, owner, meta, snapshot, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(uri) DO UPDATE SET
                meta = excluded.meta,
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
            params![meta.uri.as_str(), meta.owner, meta_json, blob, meta.updated_at as i64],
        )
        .map_err(|e| StorageError::write(&meta.uri, e))?;

        debug!(uri = %meta.uri, version = meta.version, bytes = blob.len(), "Document saved");
        Ok(())
    }

    async fn load_document(
        &self,
        uri: &DocumentUri,
    ) -> Result<Option<(DocumentMeta, DocumentSnapshot)>, StorageError> {
        let conn = self.conn.lock();

        let result: Option<(String, Vec<u8>)> = conn
            .query_row(
                "SELECT meta, snapshot FROM documents WHERE uri = ?1",
                params![uri.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StorageError::read(uri, e))?;

        match result {
            Some((meta_json, blob)) => {
                let meta: DocumentMeta =
                    serde_json::from_str(&meta_json).map_err(|e| StorageError::read(uri, e))?;
                let snapshot =
                    DocumentSnapshot::decode(&blob).map_err(|e| StorageError::read(uri, e))?;
                Ok(Some((meta, snapshot)))
            }
            None => Ok(None),
        }
    }

    async fn delete_document(&self, uri: &DocumentUri) -> Result<bool, StorageError> {
        let conn = self.conn.lock();

        let affected = conn
            .execute("DELETE FROM documents WHERE uri = ?1", params![uri.as_str()])
            .map_err(|e| StorageError::write(uri, e))?;

        Ok(affected > 0)
    }

    async fn list_documents(
        &self,
        owner: Option<UserId>,
    ) -> Result<Vec<DocumentMeta>, StorageError> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(
                r#"
                SELECT meta FROM documents
                WHERE ?1 IS NULL OR owner = ?1
                ORDER BY updated_at DESC
                "#,
            )
            .map_err(|e| StorageError::read("document list", e))?;

        let metas = stmt
            .query_map(params![owner], |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::read("document list", e))?
            .filter_map(|r| r.ok())
            .filter_map(|json| serde_json::from_str::<DocumentMeta>(&json).ok())
            .collect();

        Ok(metas)
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Option<User>, StorageError> {
        let salt = new_salt();
        let password_hash = hash_password(&salt, &account.password);
        let conn = self.conn.lock();

        let affected = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO users (username, nickname, icon, salt, password_hash)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![account.username, account.nickname, account.icon, salt, password_hash],
            )
            .map_err(|e| StorageError::create(format!("account {}", account.username), e))?;

        if affected == 0 {
            return Ok(None);
        }

        let user_id = conn.last_insert_rowid() as UserId;
        debug!(user_id, username = %account.username, "Account created");
        Self::load_user(&conn, user_id)
    }

    async fn verify_login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, StorageError> {
        let conn = self.conn.lock();

        let row: Option<(UserId, String, String)> = conn
            .query_row(
                "SELECT user_id, salt, password_hash FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| StorageError::read(format!("account {}", username), e))?;

        match row {
            Some((user_id, salt, hash)) if verify_password(&salt, password, &hash) => {
                Self::load_user(&conn, user_id)
            }
            _ => Ok(None),
        }
    }

    async fn update_account(
        &self,
        user_id: UserId,
        changes: &AccountChanges,
    ) -> Result<Option<User>, StorageError> {
        let conn = self.conn.lock();
        let what = || format!("user {}", user_id);

        if let Some(nickname) = &changes.nickname {
            conn.execute(
                "UPDATE users SET nickname = ?1 WHERE user_id = ?2",
                params![nickname, user_id],
            )
            .map_err(|e| StorageError::write(what(), e))?;
        }
        if let Some(icon) = &changes.icon {
            conn.execute("UPDATE users SET icon = ?1 WHERE user_id = ?2", params![icon, user_id])
                .map_err(|e| StorageError::write(what(), e))?;
        }
        if let Some(password) = &changes.password {
            let salt = new_salt();
            let hash = hash_password(&salt, password);
            conn.execute(
                "UPDATE users SET salt = ?1, password_hash = ?2 WHERE user_id = ?3",
                params![salt, hash, user_id],
            )
            .map_err(|e| StorageError::write(what(), e))?;
        }

        Self::load_user(&conn, user_id)
    }

    async fn add_user_document(
        &self,
        user_id: UserId,
        uri: &DocumentUri,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT OR IGNORE INTO user_documents (user_id, uri) VALUES (?1, ?2)",
            params![user_id, uri.as_str()],
        )
        .map_err(|e| StorageError::write(format!("documents of user {}", user_id), e))?;

        Ok(())
    }

    async fn remove_user_document(
        &self,
        user_id: UserId,
        uri: &DocumentUri,
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock();

        let affected = conn
            .execute(
                "DELETE FROM user_documents WHERE user_id = ?1 AND uri = ?2",
                params![user_id, uri.as_str()],
            )
            .map_err(|e| StorageError::write(format!("documents of user {}", user_id), e))?;

        Ok(affected > 0)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();

        let document_count: usize = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(|e| StorageError::read("document count", e))?;

        let account_count: usize = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .map_err(|e| StorageError::read("account count", e))?;

        Ok(StorageStats {
            document_count,
            account_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetext_core::{CharFormat, Document, Symbol};

    fn new_account(username: &str) -> NewAccount {
        NewAccount {
            username: username.into(),
            nickname: "Nick".into(),
            icon: vec![9, 9],
            password: "pw".into(),
        }
    }

    fn sample_document(owner: UserId) -> (DocumentMeta, DocumentSnapshot) {
        let mut doc = Document::with_root_block(owner);
        let block = doc.blocks().next().unwrap().id;
        for (i, ch) in "saved".chars().enumerate() {
            let pos = doc.fractional_pos_at_index(i, owner).unwrap();
            doc.insert(Symbol::new(ch, CharFormat::default(), owner, pos, block)).unwrap();
        }
        let uri = DocumentUri::generate("owner", "saved");
        (DocumentMeta::new(uri, "saved", owner), doc.snapshot())
    }

    #[tokio::test]
    async fn test_sqlite_documents() {
        let storage = SqliteStorage::in_memory().unwrap();
        let (mut meta, snapshot) = sample_document(1);

        assert!(storage.create_document(&meta, &snapshot).await.unwrap());
        assert!(!storage.create_document(&meta, &snapshot).await.unwrap());

        meta.touch();
        storage.save_document(&meta, &snapshot).await.unwrap();

        let (loaded_meta, loaded) = storage.load_document(&meta.uri).await.unwrap().unwrap();
        assert_eq!(loaded_meta.version, 2);
        assert_eq!(Document::from_snapshot(loaded).unwrap().text(), "saved");

        assert_eq!(storage.list_documents(Some(1)).await.unwrap().len(), 1);
        assert!(storage.list_documents(Some(2)).await.unwrap().is_empty());
        assert_eq!(storage.list_documents(None).await.unwrap().len(), 1);

        assert!(storage.delete_document(&meta.uri).await.unwrap());
        assert!(storage.load_document(&meta.uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_accounts() {
        let storage = SqliteStorage::in_memory().unwrap();

        let user = storage.create_account(&new_account("dave")).await.unwrap().unwrap();
        assert!(storage.create_account(&new_account("dave")).await.unwrap().is_none());
        assert_eq!(user.icon, vec![9, 9]);

        let uri = DocumentUri::new("dave:plan:1").unwrap();
        storage.add_user_document(user.user_id, &uri).await.unwrap();

        let logged = storage.verify_login("dave", "pw").await.unwrap().unwrap();
        assert_eq!(logged.documents, vec![uri.clone()]);
        assert!(storage.verify_login("dave", "nope").await.unwrap().is_none());

        let changes = AccountChanges {
            nickname: Some("D".into()),
            ..AccountChanges::default()
        };
        let updated = storage.update_account(user.user_id, &changes).await.unwrap().unwrap();
        assert_eq!(updated.nickname, "D");
        assert!(storage.update_account(404, &changes).await.unwrap().is_none());

        assert!(storage.remove_user_document(user.user_id, &uri).await.unwrap());
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.account_count, 1);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livetext.db");
        let (meta, snapshot) = sample_document(5);

        {
            let storage = SqliteStorage::new(&path).unwrap();
            storage.create_document(&meta, &snapshot).await.unwrap();
            storage.create_account(&new_account("erin")).await.unwrap();
        }

        let storage = SqliteStorage::new(&path).unwrap();
        let (_, loaded) = storage.load_document(&meta.uri).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(storage.verify_login("erin", "pw").await.unwrap().is_some());
    }
}
