//! Frame codec

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Message;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum frame size (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix
const LENGTH_LEN: usize = 4;

/// Version byte plus tag
const HEADER_LEN: usize = 3;

/// Encode a message into one complete frame
pub fn encode(message: &Message) -> ProtocolResult<Vec<u8>> {
    let payload = message.encode_payload()?;
    let mut frame = Vec::with_capacity(LENGTH_LEN + HEADER_LEN + payload.len());
    frame.put_u32((HEADER_LEN + payload.len()) as u32);
    frame.put_u8(PROTOCOL_VERSION);
    frame.put_u16(message.tag());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Bytes are fed as they arrive; [`FrameCodec::decode`] yields one message per complete frame
/// and leaves partial frames buffered.
pub struct FrameCodec {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Add data to the codec buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to decode one complete message from the buffer
    pub fn decode(&mut self) -> ProtocolResult<Option<Message>> {
        if self.buffer.len() < LENGTH_LEN {
            return Ok(None);
        }

        let prefix = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if len < HEADER_LEN {
            return Err(ProtocolError::Malformed {
                name: "frame",
                reason: format!("frame of {} bytes has no header", len),
            });
        }

        if self.buffer.len() < LENGTH_LEN + len {
            // Incomplete
            self.buffer.reserve(LENGTH_LEN + len - self.buffer.len());
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(LENGTH_LEN + len);
        frame.advance(LENGTH_LEN);

        let version = frame.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let tag = frame.get_u16();
        trace!(tag, len, "Decoded frame");

        Message::decode_payload(tag, &frame).map(Some)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use livetext_core::{
        BlockFormat, CharFormat, Document, DocumentMeta, DocumentUri, Symbol, TextBlockId,
    };
    use proptest::prelude::*;

    fn sample_insert() -> Message {
        let mut doc = Document::new();
        let block = TextBlockId::new(0, 7);
        let pos = doc.fractional_pos_begin(7).unwrap();
        CharsInsert {
            symbols: vec![Symbol::new('é', CharFormat::bold(), 7, pos, block)],
            block,
            block_format: BlockFormat::default(),
        }
        .into()
    }

    fn sample_ready() -> Message {
        let mut doc = Document::with_root_block(3);
        let block = doc.blocks().next().unwrap().id;
        for (i, ch) in "hey".chars().enumerate() {
            let pos = doc.fractional_pos_at_index(i, 3).unwrap();
            doc.insert(Symbol::new(ch, CharFormat::default(), 3, pos, block)).unwrap();
        }
        let uri = DocumentUri::new("carol:hey:0001").unwrap();
        DocumentReady {
            meta: DocumentMeta::new(uri, "hey", 3),
            snapshot: doc.snapshot(),
        }
        .into()
    }

    #[test]
    fn test_encode_decode() {
        let mut codec = FrameCodec::new();
        for msg in [sample_insert(), sample_ready(), Message::from(Ping)] {
            codec.feed(&encode(&msg).unwrap());
            assert_eq!(codec.decode().unwrap(), Some(msg));
        }
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode(&Message::from(Failure { reason: "x".into() })).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(frame[4], PROTOCOL_VERSION);
        assert_eq!(u16::from_be_bytes([frame[5], frame[6]]), 0x0603);
    }

    #[test]
    fn test_incomplete_frame() {
        let frame = encode(&sample_insert()).unwrap();
        let mut codec = FrameCodec::new();

        codec.feed(&frame[..frame.len() - 1]);
        assert!(codec.decode().unwrap().is_none());

        codec.feed(&frame[frame.len() - 1..]);
        assert!(codec.decode().unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut bytes = encode(&Message::from(Ping)).unwrap();
        bytes.extend(encode(&Message::from(Pong)).unwrap());

        let mut codec = FrameCodec::new();
        codec.feed(&bytes);
        assert_eq!(codec.decode().unwrap(), Some(Message::Ping(Ping)));
        assert_eq!(codec.decode().unwrap(), Some(Message::Pong(Pong)));
        assert_eq!(codec.decode().unwrap(), None);
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::with_max_frame_size(16);
        codec.feed(&encode(&sample_ready()).unwrap());
        assert!(matches!(codec.decode(), Err(ProtocolError::FrameTooLarge { max: 16, .. })));
    }

    #[test]
    fn test_unsupported_version() {
        let mut frame = encode(&Message::from(Ping)).unwrap();
        frame[4] = 9;
        let mut codec = FrameCodec::new();
        codec.feed(&frame);
        assert!(matches!(codec.decode(), Err(ProtocolError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_malformed_payload() {
        let mut frame = encode(&Message::from(LoginError { reason: "no".into() })).unwrap();
        // Keep the LoginError tag but send a Ping payload
        frame.truncate(7);
        frame.push(0xc0);
        let len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&len.to_be_bytes());

        let mut codec = FrameCodec::new();
        codec.feed(&frame);
        assert!(matches!(
            codec.decode(),
            Err(ProtocolError::Malformed { name: "LoginError", .. })
        ));
    }

    proptest! {
        #[test]
        fn arbitrary_splits_yield_same_messages(
            cuts in prop::collection::vec(any::<u16>(), 0..12),
        ) {
            let messages =
                vec![sample_insert(), sample_ready(), Message::from(Logout), sample_insert()];
            let mut stream = Vec::new();
            for m in &messages {
                stream.extend(encode(m).unwrap());
            }

            let mut points: Vec<usize> =
                cuts.iter().map(|c| *c as usize % (stream.len() + 1)).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();

            let mut codec = FrameCodec::new();
            let mut decoded = Vec::new();
            for w in points.windows(2) {
                codec.feed(&stream[w[0]..w[1]]);
                while let Some(m) = codec.decode().unwrap() {
                    decoded.push(m);
                }
            }

            prop_assert_eq!(decoded, messages);
            prop_assert_eq!(codec.buffered(), 0);
        }
    }
}
