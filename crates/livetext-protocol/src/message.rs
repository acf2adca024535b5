//! The closed set of protocol messages

use serde::{Deserialize, Serialize};

use livetext_core::{
    BlockFormat, CharFormat, DocumentMeta, DocumentSnapshot, DocumentUri, ListFormat, Position,
    Symbol, TextBlockId, TextListId, User, UserId,
};

use crate::error::{ProtocolError, ProtocolResult};

/// Which side is allowed to send a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server only
    ToServer,
    /// Server to client only
    ToClient,
    /// Either side (edits and presence are relayed)
    Both,
}

macro_rules! messages {
    ($( $(#[$doc:meta])* $variant:ident = $tag:literal, $dir:ident; )*) => {
        /// A decoded protocol message
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $( $(#[$doc])* $variant($variant), )*
        }

        impl Message {
            /// Wire tag of this message
            pub fn tag(&self) -> u16 {
                match self {
                    $( Message::$variant(_) => $tag, )*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $( Message::$variant(_) => stringify!($variant), )*
                }
            }

            pub fn direction(&self) -> Direction {
                match self {
                    $( Message::$variant(_) => Direction::$dir, )*
                }
            }

            pub(crate) fn encode_payload(&self) -> ProtocolResult<Vec<u8>> {
                let encoded = match self {
                    $( Message::$variant(m) => rmp_serde::to_vec_named(m), )*
                };
                encoded.map_err(|e| ProtocolError::Encode {
                    name: self.name(),
                    reason: e.to_string(),
                })
            }

            pub(crate) fn decode_payload(tag: u16, payload: &[u8]) -> ProtocolResult<Message> {
                match tag {
                    $(
                        $tag => rmp_serde::from_slice::<$variant>(payload)
                            .map(Message::$variant)
                            .map_err(|e| ProtocolError::Malformed {
                                name: stringify!($variant),
                                reason: e.to_string(),
                            }),
                    )*
                    other => Err(ProtocolError::UnknownTag(other)),
                }
            }
        }

        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

messages! {
    LoginRequest = 0x0101, ToServer;
    LoginGranted = 0x0102, ToClient;
    LoginError = 0x0103, ToClient;
    Logout = 0x0104, ToServer;
    LogoutConfirmed = 0x0105, ToClient;

    AccountCreate = 0x0201, ToServer;
    AccountUpdate = 0x0202, ToServer;
    AccountConfirmed = 0x0203, ToClient;
    AccountError = 0x0204, ToClient;

    DocumentCreate = 0x0301, ToServer;
    DocumentOpen = 0x0302, ToServer;
    DocumentRemove = 0x0303, ToServer;
    DocumentClose = 0x0304, ToServer;
    /// Full document state; the first message after a successful create or open
    DocumentReady = 0x0305, ToClient;
    DocumentDismissed = 0x0306, ToClient;
    DocumentError = 0x0307, ToClient;

    CharsInsert = 0x0401, Both;
    CharsDelete = 0x0402, Both;
    CharsFormat = 0x0403, Both;
    BlockEdit = 0x0404, Both;
    ListEdit = 0x0405, Both;

    CursorMove = 0x0501, Both;
    UserJoin = 0x0502, ToClient;
    UserLeave = 0x0503, ToClient;
    ProfileUpdate = 0x0504, ToClient;

    Ping = 0x0601, Both;
    Pong = 0x0602, Both;
    /// Fatal session error; the sender closes the connection after it
    Failure = 0x0603, ToClient;
}

impl Message {
    /// Edits that mutate the document
    pub fn is_edit(&self) -> bool {
        self.tag() >> 8 == 0x04
    }
}

// -------------------------------------------------------------------------
// Login
// -------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginGranted {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginError {
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logout;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutConfirmed;

// -------------------------------------------------------------------------
// Accounts
// -------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreate {
    pub username: String,
    pub nickname: String,
    pub icon: Vec<u8>,
    pub password: String,
}

/// Partial profile update; absent fields stay unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub nickname: Option<String>,
    pub icon: Option<Vec<u8>>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfirmed {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountError {
    pub reason: String,
}

// -------------------------------------------------------------------------
// Documents
// -------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCreate {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentOpen {
    pub uri: DocumentUri,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRemove {
    pub uri: DocumentUri,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentClose;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReady {
    pub meta: DocumentMeta,
    pub snapshot: DocumentSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDismissed {
    pub uri: DocumentUri,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentError {
    pub reason: String,
}

// -------------------------------------------------------------------------
// Edits
// -------------------------------------------------------------------------

/// Symbols typed into one block. `block_format` recreates the block on replicas that dropped it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharsInsert {
    pub symbols: Vec<Symbol>,
    pub block: TextBlockId,
    pub block_format: BlockFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharsDelete {
    pub positions: Vec<Position>,
}

/// `formats[i]` applies to `positions[i]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharsFormat {
    pub positions: Vec<Position>,
    pub formats: Vec<CharFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEdit {
    pub block: TextBlockId,
    pub format: BlockFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEdit {
    pub block: TextBlockId,
    pub list: Option<TextListId>,
    pub format: ListFormat,
}

// -------------------------------------------------------------------------
// Presence
// -------------------------------------------------------------------------

/// `position` is the symbol the cursor follows; `None` is the start of the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorMove {
    pub user_id: UserId,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoin {
    pub user_id: UserId,
    pub nickname: String,
    pub icon: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeave {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub user_id: UserId,
    pub nickname: String,
    pub icon: Vec<u8>,
}

// -------------------------------------------------------------------------
// Session
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_groups() {
        assert_eq!(Message::from(Ping).tag(), 0x0601);
        assert_eq!(Message::from(Logout).tag() >> 8, 0x01);
        assert!(Message::from(CharsDelete { positions: vec![] }).is_edit());
        assert!(!Message::from(CursorMove { user_id: 1, position: None }).is_edit());
    }

    #[test]
    fn test_direction() {
        assert_eq!(Message::from(DocumentClose).direction(), Direction::ToServer);
        assert_eq!(
            Message::from(DocumentError { reason: "gone".into() }).direction(),
            Direction::ToClient
        );
        assert_eq!(Message::from(Pong).direction(), Direction::Both);
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            Message::decode_payload(0x7777, &[0xc0]),
            Err(ProtocolError::UnknownTag(0x7777))
        ));
    }

    #[test]
    fn test_unit_payload_roundtrip() {
        let payload = Message::from(Logout).encode_payload().unwrap();
        assert_eq!(Message::decode_payload(0x0104, &payload).unwrap(), Message::Logout(Logout));
    }
}
