//! Server-side tunnel routing
//!
//! Session multiplexing for a tunnel's control channel, the byte relay that
//! connects a session to its socket, and the registries that give each TCP
//! port or HTTP vhost exactly one live owner.

pub mod fd;
pub mod http;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tcp;

pub use fd::{TrafficStats, TunnelFd, TunnelSnapshot};
pub use http::{extract_host, normalize_host, HttpRegistry};
pub use registry::{RegistryError, TunnelRegistry};
pub use relay::{relay, RelaySide};
pub use session::{PeerCommand, PeerHandle, PeerReceiver, SessionChannels, SessionError};
pub use tcp::{PeerAcceptor, TcpRegistry};

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide tunnel id; never reused
pub fn next_tunnel_id() -> u64 {
    NEXT_TUNNEL_ID.fetch_add(1, Ordering::SeqCst)
}
