use natrelay_proto::{ChannelClosed, CodecError, HandshakeError};
use thiserror::Error;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Tunnel rejected: {0}")]
    Rejected(String),

    #[error("Control channel closed")]
    ChannelClosed,
}

impl From<ChannelClosed> for ClientError {
    fn from(_: ChannelClosed) -> Self {
        ClientError::ChannelClosed
    }
}

impl ClientError {
    /// Refusals from the server are final; everything else is transport
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::Rejected(_))
    }
}
