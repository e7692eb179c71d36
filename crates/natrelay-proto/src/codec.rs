//! Codec for framing protocol messages on a byte stream
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! [length: u32][version: u8][type: u8][head_len: u32][head][data]
//! ```
//!
//! `length` counts every byte after itself. The decoder buffers until the
//! whole frame is available and never looks past the length prefix before that.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{MessageType, ProtoMessage, SessionHead};
use crate::{MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// Codec errors. Any of these is fatal to the connection that produced it.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Truncated field: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Length-prefixed frame codec for [`ProtoMessage`]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Size of the length prefix
    pub const LENGTH_SIZE: usize = 4;

    /// Fixed bytes after the length prefix: version (1) + type (1) + head_len (4)
    pub const FIXED_SIZE: usize = 6;

    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = ProtoMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for length header
        if src.len() < Self::LENGTH_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..Self::LENGTH_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(length));
        }

        if length < Self::FIXED_SIZE {
            return Err(CodecError::Truncated {
                expected: Self::FIXED_SIZE,
                actual: length,
            });
        }

        if src.len() < Self::LENGTH_SIZE + length {
            src.reserve(Self::LENGTH_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Self::LENGTH_SIZE);
        let mut frame = src.split_to(length);

        let version = frame.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let kind = MessageType::from_code(frame.get_u8());
        let head_len = frame.get_u32() as usize;
        if head_len > frame.len() {
            return Err(CodecError::Truncated {
                expected: head_len,
                actual: frame.len(),
            });
        }

        let head = frame.split_to(head_len).freeze();
        let data = frame.freeze();

        if kind.is_session_bearing() && head.len() < SessionHead::SIZE {
            return Err(CodecError::Truncated {
                expected: SessionHead::SIZE,
                actual: head.len(),
            });
        }

        Ok(Some(ProtoMessage { kind, head, data }))
    }
}

impl Encoder<ProtoMessage> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ProtoMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = Self::FIXED_SIZE + item.head.len() + item.data.len();
        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(length));
        }

        dst.reserve(Self::LENGTH_SIZE + length);
        dst.put_u32(length as u32);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(item.kind.code());
        dst.put_u32(item.head.len() as u32);
        dst.extend_from_slice(&item.head);
        dst.extend_from_slice(&item.data);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encode(msg: ProtoMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_layout() {
        let msg = ProtoMessage::transfer(SessionHead::new(1, 2), Bytes::from_static(b"abc"));
        let buf = encode(msg);

        // length = 6 fixed + 16 head + 3 data
        assert_eq!(&buf[..4], &25u32.to_be_bytes());
        assert_eq!(buf[4], PROTOCOL_VERSION);
        assert_eq!(buf[5], MessageType::Transfer.code());
        assert_eq!(&buf[6..10], &16u32.to_be_bytes());
        assert_eq!(&buf[buf.len() - 3..], b"abc");
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = ProtoMessage::transfer(SessionHead::new(7, 8), Bytes::from_static(b"payload"));
        let encoded = encode(msg.clone());
        let mut codec = FrameCodec::new();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        // Everything but the last byte
        buf.extend_from_slice(&encoded[4..encoded.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let msg = ProtoMessage::response_err("nope");
        let encoded = encode(msg.clone());
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let mut decoded = None;
        for byte in encoded.iter() {
            assert!(decoded.is_none(), "decoded before the frame was complete");
            buf.put_u8(*byte);
            decoded = codec.decode(&mut buf).unwrap();
        }
        assert_eq!(decoded, Some(msg));
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let first = ProtoMessage::ping();
        let second = ProtoMessage::transfer(SessionHead::new(3, 4), Bytes::from_static(b"xy"));

        let mut buf = encode(first.clone());
        let second_encoded = encode(second.clone());
        buf.extend_from_slice(&second_encoded[..5]);

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(buf.len(), 5);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&second_encoded[5..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
    }

    #[test]
    fn test_unknown_type_decodes() {
        let msg = ProtoMessage::new(
            MessageType::Unknown(99),
            Bytes::new(),
            Bytes::from_static(b"future"),
        );
        let mut buf = encode(msg);

        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageType::Unknown(99));
        assert_eq!(&decoded.data[..], b"future");
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::with_max_frame_size(64);
        let mut buf = BytesMut::new();
        buf.put_u32(65);
        buf.put_u8(PROTOCOL_VERSION);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(65))
        ));

        let big = ProtoMessage::request(Bytes::from(vec![0u8; 100]));
        let mut out = BytesMut::new();
        assert!(matches!(
            codec.encode(big, &mut out),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let mut buf = encode(ProtoMessage::pong());
        buf[4] = PROTOCOL_VERSION + 1;

        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(CodecError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_session_message_without_head_rejected() {
        let msg = ProtoMessage::new(MessageType::Transfer, Bytes::new(), Bytes::from_static(b"x"));
        let mut buf = encode(msg);

        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(CodecError::Truncated { .. })
        ));
    }
}
