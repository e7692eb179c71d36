//! Tunnel Protocol Definitions
//!
//! This crate defines the wire protocol spoken between the relay server and
//! its clients: the length-prefixed frame codec, the message enumeration, the
//! serializable tunnel request, the optional payload hardening (key exchange,
//! GZip, AES-128-GCM) and the control channel I/O pump shared by both sides.

pub mod channel;
pub mod codec;
pub mod messages;
pub mod payload;
pub mod port_range;
pub mod request;

pub use channel::{ChannelClosed, ChannelConfig, CloseCause, ControlChannel, ControlStream};
pub use codec::{CodecError, FrameCodec};
pub use messages::{MessageType, ProtoMessage, SessionHead};
pub use payload::{
    ClientHandshake, Features, HandshakeError, PayloadCodec, PayloadError, ServerHandshake,
};
pub use port_range::{PortRange, PortRangeError};
pub use request::{BasicAuth, TunnelRequest, TunnelType, REMOTE_ADDR_TOKEN};

/// Protocol version carried in every frame ahead of the type byte
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (4MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
