//! Public TCP peers entering a tunnel

use std::net::SocketAddr;
use std::sync::Arc;

use natrelay_proto::ProtoMessage;
use natrelay_router::{relay, PeerAcceptor, PeerHandle, RelaySide, TunnelFd};
use tokio::net::TcpStream;
use tracing::debug;

/// Opens a session for every peer accepted on a TCP tunnel port and relays
/// it over the owning control channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemotePeerAcceptor;

impl PeerAcceptor for RemotePeerAcceptor {
    fn accept(&self, fd: Arc<TunnelFd>, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let peer = peer_addr.to_string();
        let (handle, receiver) = PeerHandle::new(peer.clone());
        let sessions = fd.sessions().clone();

        let session_id = match sessions.put(handle) {
            Ok(id) => id,
            Err(e) => {
                debug!("Dropping peer {}: {}", peer, e);
                return;
            }
        };

        let connected = ProtoMessage::remote_connected(sessions.head(session_id), &peer);
        if sessions.control().send(connected).is_err() {
            sessions.remove(session_id);
            return;
        }

        debug!(
            "Session {}:{} opened for {}",
            fd.tunnel_id(),
            session_id,
            peer
        );
        tokio::spawn(relay(
            stream,
            session_id,
            receiver,
            sessions,
            RelaySide::Remote,
            Some(fd.stats().clone()),
        ));
    }
}
