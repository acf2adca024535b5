//! User accounts

use serde::{Deserialize, Serialize};

use crate::document::DocumentUri;
use crate::error::{Error, Result};
use crate::symbol::AuthorId;

/// Numeric account id; also the author id of everything the user types
pub type UserId = AuthorId;

/// Maximum username length in bytes
pub const MAX_USERNAME_LEN: usize = 64;

/// A registered user as seen by peers and by the account owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub nickname: String,
    /// Encoded avatar image, opaque to the server
    #[serde(with = "binary")]
    pub icon: Vec<u8>,
    /// Documents the user has created or opened, most recent last
    pub documents: Vec<DocumentUri>,
}

impl User {
    pub fn new(user_id: UserId, username: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            nickname: nickname.into(),
            icon: Vec::new(),
            documents: Vec::new(),
        }
    }

    /// Record a document in the user's list if not already present
    pub fn add_document(&mut self, uri: DocumentUri) -> bool {
        if self.documents.contains(&uri) {
            return false;
        }
        self.documents.push(uri);
        true
    }

    pub fn remove_document(&mut self, uri: &DocumentUri) -> bool {
        let before = self.documents.len();
        self.documents.retain(|d| d != uri);
        self.documents.len() != before
    }
}

/// Check a username: non-empty, at most 64 bytes, `[a-zA-Z0-9_.-]`
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(Error::InvalidUsername("Username cannot be empty".into()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(Error::InvalidUsername("Username exceeds 64 bytes".into()));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::InvalidUsername(format!("'{}' contains invalid characters", username)));
    }
    Ok(())
}

/// Icons travel as MessagePack binary rather than an array of integers
mod binary {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a byte buffer")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Vec<u8>, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut out = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("bob_2.x-y").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_document_list() {
        let mut user = User::new(1, "alice", "Alice");
        let uri = DocumentUri::new("alice:notes:1").unwrap();
        assert!(user.add_document(uri.clone()));
        assert!(!user.add_document(uri.clone()));
        assert!(user.remove_document(&uri));
        assert!(user.documents.is_empty());
    }

    #[test]
    fn test_icon_roundtrips_as_binary() {
        let mut user = User::new(3, "carol", "Carol");
        user.icon = vec![0x89, b'P', b'N', b'G'];
        let bytes = rmp_serde::to_vec_named(&user).unwrap();
        let back: User = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, user);
    }
}
