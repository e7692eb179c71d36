//! Protocol message types

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::CodecError;

/// Message type carried in the type byte of every frame.
///
/// The numeric codes are part of the wire contract and must never be
/// renumbered without bumping [`crate::PROTOCOL_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    Handshake,
    Request,
    ResponseOk,
    ResponseErr,
    Transfer,
    RemoteConnected,
    RemoteDisconnect,
    LocalConnected,
    LocalDisconnect,
    ForceOff,
    ForceOffReply,
    /// A type code this build does not know about
    Unknown(u8),
}

impl MessageType {
    pub fn code(&self) -> u8 {
        match self {
            MessageType::Ping => 1,
            MessageType::Pong => 2,
            MessageType::Handshake => 3,
            MessageType::Request => 4,
            MessageType::ResponseOk => 5,
            MessageType::ResponseErr => 6,
            MessageType::Transfer => 7,
            MessageType::RemoteConnected => 8,
            MessageType::RemoteDisconnect => 9,
            MessageType::LocalConnected => 10,
            MessageType::LocalDisconnect => 11,
            MessageType::ForceOff => 12,
            MessageType::ForceOffReply => 13,
            MessageType::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => MessageType::Ping,
            2 => MessageType::Pong,
            3 => MessageType::Handshake,
            4 => MessageType::Request,
            5 => MessageType::ResponseOk,
            6 => MessageType::ResponseErr,
            7 => MessageType::Transfer,
            8 => MessageType::RemoteConnected,
            9 => MessageType::RemoteDisconnect,
            10 => MessageType::LocalConnected,
            11 => MessageType::LocalDisconnect,
            12 => MessageType::ForceOff,
            13 => MessageType::ForceOffReply,
            other => MessageType::Unknown(other),
        }
    }

    /// Whether the head of this message must be a [`SessionHead`]
    pub fn is_session_bearing(&self) -> bool {
        matches!(
            self,
            MessageType::Transfer
                | MessageType::RemoteConnected
                | MessageType::RemoteDisconnect
                | MessageType::LocalConnected
                | MessageType::LocalDisconnect
        )
    }
}

/// Tunnel id + session id pair addressing one multiplexed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHead {
    pub tunnel_id: u64,
    pub session_id: u64,
}

impl SessionHead {
    /// Encoded size: tunnel_id (8) + session_id (8)
    pub const SIZE: usize = 16;

    pub fn new(tunnel_id: u64, session_id: u64) -> Self {
        Self {
            tunnel_id,
            session_id,
        }
    }

    /// Head for tunnel-scoped messages that do not address a session
    pub fn tunnel(tunnel_id: u64) -> Self {
        Self::new(tunnel_id, 0)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64(self.tunnel_id);
        buf.put_u64(self.session_id);
        buf.freeze()
    }

    pub fn decode(head: &[u8]) -> Result<Self, CodecError> {
        if head.len() < Self::SIZE {
            return Err(CodecError::Truncated {
                expected: Self::SIZE,
                actual: head.len(),
            });
        }
        let mut buf = head;
        let tunnel_id = buf.get_u64();
        let session_id = buf.get_u64();
        Ok(Self {
            tunnel_id,
            session_id,
        })
    }
}

/// One frame on the control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoMessage {
    pub kind: MessageType,
    pub head: Bytes,
    pub data: Bytes,
}

impl ProtoMessage {
    pub fn new(kind: MessageType, head: Bytes, data: Bytes) -> Self {
        Self { kind, head, data }
    }

    fn with_session(kind: MessageType, head: SessionHead, data: Bytes) -> Self {
        Self::new(kind, head.encode(), data)
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Bytes::new(), Bytes::new())
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, Bytes::new(), Bytes::new())
    }

    pub fn handshake(data: Bytes) -> Self {
        Self::new(MessageType::Handshake, Bytes::new(), data)
    }

    /// REQUEST carrying a serialized [`crate::TunnelRequest`]
    pub fn request(data: Bytes) -> Self {
        Self::new(MessageType::Request, Bytes::new(), data)
    }

    /// RESPONSE_OK carrying the assigned tunnel id and the confirmed request
    pub fn response_ok(tunnel_id: u64, data: Bytes) -> Self {
        Self::with_session(MessageType::ResponseOk, SessionHead::tunnel(tunnel_id), data)
    }

    pub fn response_err(reason: &str) -> Self {
        Self::new(
            MessageType::ResponseErr,
            Bytes::new(),
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn transfer(head: SessionHead, data: Bytes) -> Self {
        Self::with_session(MessageType::Transfer, head, data)
    }

    /// REMOTE_CONNECTED with the remote peer address as payload
    pub fn remote_connected(head: SessionHead, peer_addr: &str) -> Self {
        Self::with_session(
            MessageType::RemoteConnected,
            head,
            Bytes::copy_from_slice(peer_addr.as_bytes()),
        )
    }

    pub fn remote_disconnect(head: SessionHead) -> Self {
        Self::with_session(MessageType::RemoteDisconnect, head, Bytes::new())
    }

    pub fn local_connected(head: SessionHead) -> Self {
        Self::with_session(MessageType::LocalConnected, head, Bytes::new())
    }

    pub fn local_disconnect(head: SessionHead) -> Self {
        Self::with_session(MessageType::LocalDisconnect, head, Bytes::new())
    }

    pub fn force_off(tunnel_id: u64) -> Self {
        Self::with_session(MessageType::ForceOff, SessionHead::tunnel(tunnel_id), Bytes::new())
    }

    pub fn force_off_reply(tunnel_id: u64) -> Self {
        Self::with_session(
            MessageType::ForceOffReply,
            SessionHead::tunnel(tunnel_id),
            Bytes::new(),
        )
    }

    /// Parse the head as a [`SessionHead`]
    pub fn session_head(&self) -> Result<SessionHead, CodecError> {
        SessionHead::decode(&self.head)
    }

    /// Payload interpreted as UTF-8 text (lossy), used for error reasons and addresses
    pub fn data_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}
