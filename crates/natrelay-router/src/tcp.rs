//! TCP port registry
//!
//! Owns one listening socket per registered port. Each accepted peer is
//! resolved back to its tunnel by the socket's local port and handed to a
//! [`PeerAcceptor`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::fd::{TunnelFd, TunnelSnapshot};
use crate::registry::{RegistryError, TunnelRegistry};
use crate::session::SessionChannels;

/// Receives peers accepted on a tunnel's public port
pub trait PeerAcceptor: Send + Sync + 'static {
    fn accept(&self, fd: Arc<TunnelFd>, stream: TcpStream, peer_addr: SocketAddr);
}

pub struct TcpRegistry {
    tunnels: Arc<TunnelRegistry<u16>>,
    bind_addr: IpAddr,
    acceptor: Arc<dyn PeerAcceptor>,
}

impl TcpRegistry {
    pub fn new(acceptor: Arc<dyn PeerAcceptor>) -> Self {
        Self::with_bind_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED), acceptor)
    }

    pub fn with_bind_addr(bind_addr: IpAddr, acceptor: Arc<dyn PeerAcceptor>) -> Self {
        Self {
            tunnels: Arc::new(TunnelRegistry::new()),
            bind_addr,
            acceptor,
        }
    }

    pub fn bind_addr(&self) -> IpAddr {
        self.bind_addr
    }

    /// Bind `port` and register the tunnel on it.
    ///
    /// The bind happens while the port's registry slot is held, so two
    /// concurrent registrations of one port cannot both get past it.
    pub fn register(
        &self,
        port: u16,
        sessions: Arc<SessionChannels>,
    ) -> Result<Arc<TunnelFd>, RegistryError> {
        let mut bound = None;
        let fd = self.tunnels.register_with(port, || {
            let listener = bind(self.bind_addr, port)?;
            bound = Some(listener);
            Ok(TunnelFd::new(port.to_string(), false, sessions))
        })?;

        if let Some(listener) = bound {
            let handle = tokio::spawn(accept_loop(
                listener,
                port,
                fd.clone(),
                self.tunnels.clone(),
                self.acceptor.clone(),
            ));
            fd.set_listener_task(handle);
        }

        info!(
            "TCP tunnel {} listening on {}:{}",
            fd.tunnel_id(),
            self.bind_addr,
            port
        );
        Ok(fd)
    }

    /// Unregister and wait until the port is free again
    pub async fn unregister(&self, port: u16) -> Option<Arc<TunnelFd>> {
        let fd = self.tunnels.unregister(&port)?;
        fd.released().await;
        Some(fd)
    }

    /// Unregister only while `tunnel_id` still owns `port`
    pub async fn unregister_tunnel(&self, port: u16, tunnel_id: u64) -> Option<Arc<TunnelFd>> {
        let fd = self.tunnels.unregister_tunnel(&port, tunnel_id)?;
        fd.released().await;
        Some(fd)
    }

    pub fn lookup(&self, port: u16) -> Option<Arc<TunnelFd>> {
        self.tunnels.lookup(&port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.tunnels.contains(&port)
    }

    pub fn force_off(&self, port: u16) -> bool {
        self.tunnels.force_off(&port)
    }

    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        self.tunnels.snapshot()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub async fn shutdown(&self) {
        for fd in self.tunnels.shutdown() {
            fd.released().await;
        }
    }

    /// Whether `port` can be bound right now at OS level
    pub fn is_port_bindable(&self, port: u16) -> bool {
        std::net::TcpListener::bind((self.bind_addr, port)).is_ok()
    }
}

fn bind(addr: IpAddr, port: u16) -> Result<TcpListener, RegistryError> {
    let to_err = |e: std::io::Error| RegistryError::Bind {
        port,
        reason: e.to_string(),
    };

    let std_listener = std::net::TcpListener::bind((addr, port)).map_err(to_err)?;
    std_listener.set_nonblocking(true).map_err(to_err)?;
    TcpListener::from_std(std_listener).map_err(to_err)
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    fd: Arc<TunnelFd>,
    tunnels: Arc<TunnelRegistry<u16>>,
    acceptor: Arc<dyn PeerAcceptor>,
) {
    let shutdown = fd.shutdown_token();
    drop(fd);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(port);
                    match tunnels.lookup(&local_port) {
                        Some(fd) if !fd.is_closed() => {
                            debug!("Peer {} connected to port {}", peer_addr, local_port);
                            acceptor.accept(fd, stream, peer_addr);
                        }
                        _ => {
                            debug!("Dropping peer {}: no tunnel on port {}", peer_addr, local_port);
                        }
                    }
                }
                Err(e) => {
                    warn!("Accept failed on port {}: {}", port, e);
                }
            }
        }
    }

    debug!("Listener on port {} released", port);
}
