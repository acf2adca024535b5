//! LiveText wire protocol
//!
//! Every message travels in one length-prefixed binary frame.
//!
//! ## Frame Format
//! ```text
//! +----------------+-----------+-------------+---------------------+
//! | length: u32 BE | version u8 | tag: u16 BE | MessagePack payload |
//! +----------------+-----------+-------------+---------------------+
//! ```
//!
//! `length` counts the bytes after the length field. Tags are grouped by area:
//!
//! ```text
//! 0x01xx  login        0x04xx  edits
//! 0x02xx  accounts     0x05xx  presence
//! 0x03xx  documents    0x06xx  session keepalive and failures
//! ```

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{encode, FrameCodec, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use error::{ProtocolError, ProtocolResult};
pub use message::*;
