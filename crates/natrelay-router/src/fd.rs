//! Live tunnel handles and traffic accounting

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use natrelay_proto::{ControlChannel, ProtoMessage, TunnelRequest, TunnelType};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::SessionChannels;

/// Byte counters for one tunnel.
///
/// Inbound is remote peer → tunnel, outbound is tunnel → remote peer.
#[derive(Debug)]
pub struct TrafficStats {
    inbound: AtomicU64,
    outbound: AtomicU64,
    created_at: DateTime<Utc>,
    updated_at_ms: AtomicI64,
}

impl TrafficStats {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            inbound: AtomicU64::new(0),
            outbound: AtomicU64::new(0),
            created_at: now,
            updated_at_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn add_inbound(&self, bytes: usize) {
        self.inbound.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_outbound(&self, bytes: usize) {
        self.outbound.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.updated_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn inbound(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }

    pub fn outbound(&self) -> u64 {
        self.outbound.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.updated_at_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Status row for one active tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub tunnel_id: u64,
    pub name: Option<String>,
    pub tunnel_type: TunnelType,
    /// Remote port for TCP, vhost for HTTP/HTTPS
    pub key: String,
    pub local_addr: String,
    pub local_port: u16,
    pub connection_count: usize,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Server-side handle to a registered tunnel
pub struct TunnelFd {
    key: String,
    is_https: bool,
    sessions: Arc<SessionChannels>,
    stats: Arc<TrafficStats>,
    shutdown: CancellationToken,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TunnelFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelFd")
            .field("tunnel_id", &self.tunnel_id())
            .field("key", &self.key)
            .field("is_https", &self.is_https)
            .finish()
    }
}

impl TunnelFd {
    pub fn new(key: impl Into<String>, is_https: bool, sessions: Arc<SessionChannels>) -> Self {
        Self {
            key: key.into(),
            is_https,
            sessions,
            stats: Arc::new(TrafficStats::new()),
            shutdown: CancellationToken::new(),
            listener_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tunnel_id(&self) -> u64 {
        self.sessions.tunnel_id()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_https(&self) -> bool {
        self.is_https
    }

    pub fn sessions(&self) -> &Arc<SessionChannels> {
        &self.sessions
    }

    pub fn request(&self) -> &TunnelRequest {
        self.sessions.request()
    }

    pub fn control(&self) -> &ControlChannel {
        self.sessions.control()
    }

    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }

    /// Cancelled when the tunnel is closed; per-tunnel tasks select on it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn set_listener_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut slot) = self.listener_task.lock() {
            *slot = Some(handle);
        }
    }

    /// Ask the owning client to disconnect without reconnecting
    pub fn force_off(&self) -> bool {
        debug!("Force-off tunnel {} ({})", self.tunnel_id(), self.key);
        self.control()
            .send(ProtoMessage::force_off(self.tunnel_id()))
            .is_ok()
    }

    /// Stop accepting and drop every session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing tunnel {} ({})", self.tunnel_id(), self.key);
        self.shutdown.cancel();
        self.sessions.force_close_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the bound listening socket (if any) has been dropped
    pub async fn released(&self) {
        let handle = self.listener_task.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let request = self.request();
        TunnelSnapshot {
            tunnel_id: self.tunnel_id(),
            name: request.name.clone(),
            tunnel_type: request.tunnel_type,
            key: self.key.clone(),
            local_addr: request.local_addr.clone(),
            local_port: request.local_port,
            connection_count: self.sessions.len(),
            inbound_bytes: self.stats.inbound(),
            outbound_bytes: self.stats.outbound(),
            created_at: self.stats.created_at(),
            updated_at: self.stats.updated_at(),
        }
    }
}
