//! Per-tunnel session multiplexing

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use natrelay_proto::{ControlChannel, SessionHead, TunnelRequest};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Tunnel {0} is closed")]
    Closed(u64),

    #[error("Session {0} already exists")]
    Duplicate(u64),
}

/// Instruction for the task that owns a peer connection
#[derive(Debug)]
pub enum PeerCommand {
    Data(Bytes),
    Close,
}

/// Sending side of one session's peer connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
    cancel: CancellationToken,
    peer_addr: String,
}

/// Receiving side, owned by the relay task
#[derive(Debug)]
pub struct PeerReceiver {
    pub(crate) commands: mpsc::UnboundedReceiver<PeerCommand>,
    pub(crate) cancel: CancellationToken,
}

impl PeerHandle {
    pub fn new(peer_addr: impl Into<String>) -> (Self, PeerReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        (
            Self {
                commands: tx,
                cancel: cancel.clone(),
                peer_addr: peer_addr.into(),
            },
            PeerReceiver {
                commands: rx,
                cancel,
            },
        )
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Queue bytes for the peer. Returns false once the peer is gone.
    pub fn send(&self, data: Bytes) -> bool {
        !self.cancel.is_cancelled() && self.commands.send(PeerCommand::Data(data)).is_ok()
    }

    /// Close after queued data has been written
    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }

    /// Drop the connection now
    pub fn force_close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }
}

/// Session table for one tunnel.
///
/// Shared by the control channel reader (routing TRANSFER frames) and every
/// relay task of the tunnel.
pub struct SessionChannels {
    tunnel_id: u64,
    request: TunnelRequest,
    control: ControlChannel,
    sessions: DashMap<u64, PeerHandle>,
    next_session_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannels")
            .field("tunnel_id", &self.tunnel_id)
            .field("sessions", &self.sessions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionChannels {
    pub fn new(tunnel_id: u64, request: TunnelRequest, control: ControlChannel) -> Self {
        Self {
            tunnel_id,
            request,
            control,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tunnel_id(&self) -> u64 {
        self.tunnel_id
    }

    pub fn request(&self) -> &TunnelRequest {
        &self.request
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    pub fn head(&self, session_id: u64) -> SessionHead {
        SessionHead::new(self.tunnel_id, session_id)
    }

    /// Register a peer under a freshly issued session id
    pub fn put(&self, peer: PeerHandle) -> Result<u64, SessionError> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(session_id, peer);
        self.admit(session_id)?;
        trace!("Tunnel {} session {} registered", self.tunnel_id, session_id);
        Ok(session_id)
    }

    /// Register a peer under an id chosen by the other side of the tunnel
    pub fn put_with_id(&self, session_id: u64, peer: PeerHandle) -> Result<(), SessionError> {
        match self.sessions.entry(session_id) {
            Entry::Occupied(_) => return Err(SessionError::Duplicate(session_id)),
            Entry::Vacant(entry) => {
                entry.insert(peer);
            }
        }
        self.admit(session_id)
    }

    // A put racing force_close_all either sees `closed` here or is swept;
    // whoever removes the entry closes it.
    fn admit(&self, session_id: u64) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            if let Some((_, peer)) = self.sessions.remove(&session_id) {
                peer.force_close();
            }
            return Err(SessionError::Closed(self.tunnel_id));
        }
        Ok(())
    }

    pub fn get(&self, session_id: u64) -> Option<PeerHandle> {
        self.sessions.get(&session_id).map(|e| e.value().clone())
    }

    /// Idempotent; the caller that gets `Some` owns closing the peer
    pub fn remove(&self, session_id: u64) -> Option<PeerHandle> {
        self.sessions.remove(&session_id).map(|(_, peer)| peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_ids(&self) -> Vec<u64> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    /// Refuse new sessions, then force-close every live one exactly once
    pub fn force_close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let mut closed = 0usize;
        for session_id in self.session_ids() {
            if let Some(peer) = self.remove(session_id) {
                peer.force_close();
                closed += 1;
            }
        }

        if closed > 0 {
            debug!("Tunnel {}: force-closed {} sessions", self.tunnel_id, closed);
        }
    }
}
