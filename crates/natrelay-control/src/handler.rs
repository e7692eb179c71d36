//! Server side of the control channel
//!
//! One [`TunnelHandler`] serves every control connection. Each connection
//! moves through `AWAIT_REQUEST -> (HANDSHAKE) -> TUNNEL_ACTIVE -> CLOSED`;
//! the tunnel it registers lives exactly as long as the connection.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use natrelay_proto::{
    ChannelConfig, ControlChannel, ControlStream, FrameCodec, MessageType, PayloadCodec,
    ProtoMessage, ServerHandshake, TunnelRequest, TunnelType,
};
use natrelay_router::{
    next_tunnel_id, HttpRegistry, RegistryError, SessionChannels, TcpRegistry, TunnelFd,
    TunnelSnapshot,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::interceptor::{AdmissionError, TunnelRequestInterceptor};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry slot owned by a connection
#[derive(Debug, Clone)]
enum TunnelKey {
    Tcp(u16),
    Http(String),
    Https(String),
}

struct ActiveTunnel {
    key: TunnelKey,
    fd: Arc<TunnelFd>,
}

/// Per-connection state, owned by the task serving that connection
struct ConnectionState {
    peer_addr: SocketAddr,
    encrypted: bool,
    tunnel: Option<ActiveTunnel>,
}

impl ConnectionState {
    fn tunnel_id(&self) -> Option<u64> {
        self.tunnel.as_ref().map(|t| t.fd.tunnel_id())
    }
}

/// Accepts control connections and registers their tunnels
pub struct TunnelHandler {
    tcp: Arc<TcpRegistry>,
    http: Arc<HttpRegistry>,
    https: Arc<HttpRegistry>,
    interceptor: Arc<dyn TunnelRequestInterceptor>,
    channel_config: ChannelConfig,
    require_encryption: bool,
    shutdown: CancellationToken,
}

impl TunnelHandler {
    pub fn new(
        tcp: Arc<TcpRegistry>,
        http: Arc<HttpRegistry>,
        https: Arc<HttpRegistry>,
        interceptor: Arc<dyn TunnelRequestInterceptor>,
    ) -> Self {
        Self {
            tcp,
            http,
            https,
            interceptor,
            channel_config: ChannelConfig::default(),
            require_encryption: false,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    /// Refuse REQUESTs that were not preceded by an encrypting handshake
    pub fn with_require_encryption(mut self, require: bool) -> Self {
        self.require_encryption = require;
        self
    }

    pub fn tcp_registry(&self) -> &Arc<TcpRegistry> {
        &self.tcp
    }

    pub fn http_registry(&self) -> &Arc<HttpRegistry> {
        &self.http
    }

    pub fn https_registry(&self) -> &Arc<HttpRegistry> {
        &self.https
    }

    /// Status of every live tunnel
    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let mut all = self.tcp.snapshot();
        all.extend(self.http.snapshot());
        all.extend(self.https.snapshot());
        all
    }

    /// Stop accepting and close every live control connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept control connections until [`TunnelHandler::shutdown`].
    ///
    /// With an acceptor, every connection is TLS-terminated before the
    /// protocol starts.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>) {
        match listener.local_addr() {
            Ok(addr) => info!(
                "Control listener on {} ({})",
                addr,
                if tls.is_some() { "tls" } else { "plain" }
            ),
            Err(e) => warn!("Control listener address unavailable: {}", e),
        }

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept control connection: {}", e);
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);

            let handler = self.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                let Some(acceptor) = tls else {
                    handler.handle_connection(stream, peer_addr).await;
                    return;
                };
                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(stream)) => handler.handle_connection(stream, peer_addr).await,
                    Ok(Err(e)) => warn!("TLS handshake with {} failed: {}", peer_addr, e),
                    Err(_) => warn!("TLS handshake with {} timed out", peer_addr),
                }
            });
        }

        debug!("Control listener stopped");
    }

    /// Drive one control connection to completion
    pub async fn handle_connection<S: ControlStream>(&self, stream: S, peer_addr: SocketAddr) {
        info!("New control connection from {}", peer_addr);
        let mut framed = Framed::new(stream, FrameCodec::new());

        let first = match tokio::time::timeout(self.channel_config.read_timeout, framed.next())
            .await
        {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!("Protocol error from {}: {}", peer_addr, e);
                return;
            }
            Ok(None) => {
                debug!("Connection from {} closed before first message", peer_addr);
                return;
            }
            Err(_) => {
                warn!("No message from {} within {:?}", peer_addr, self.channel_config.read_timeout);
                return;
            }
        };

        let (payload, pending) = if first.kind == MessageType::Handshake {
            let (payload, reply) = match ServerHandshake::respond(&first.data) {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    warn!("Handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };
            if let Err(e) = framed.send(ProtoMessage::handshake(reply)).await {
                warn!("Failed to answer handshake from {}: {}", peer_addr, e);
                return;
            }
            debug!(
                "Handshake with {} complete (compress: {}, encrypt: {})",
                peer_addr,
                payload.is_compressed(),
                payload.is_encrypted()
            );
            (payload, None)
        } else {
            let payload = PayloadCodec::plain();
            match payload.open(first.data.clone()) {
                Ok(data) => (payload, Some(ProtoMessage { data, ..first })),
                Err(e) => {
                    warn!("Bad payload from {}: {}", peer_addr, e);
                    return;
                }
            }
        };

        let mut state = ConnectionState {
            peer_addr,
            encrypted: payload.is_encrypted(),
            tunnel: None,
        };
        let (control, mut inbound) =
            ControlChannel::spawn(framed, payload, self.channel_config.clone());

        let mut flow = ControlFlow::Continue(());
        if let Some(msg) = pending {
            flow = self.dispatch(&control, &mut state, msg).await;
        }

        while flow.is_continue() {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    control.close();
                    break;
                }
                msg = inbound.recv() => msg,
            };
            match msg {
                Some(msg) => flow = self.dispatch(&control, &mut state, msg).await,
                None => break,
            }
        }

        // Drain until the I/O tasks have stopped so close() can flush
        while inbound.recv().await.is_some() {}

        let tunnel_id = state.tunnel_id();
        if let Some(tunnel) = state.tunnel.take() {
            self.release(tunnel).await;
        }

        match control.cause() {
            Some(cause) if cause.is_error() => warn!(
                "Control connection from {} closed (tunnel {:?}): {:?}",
                peer_addr, tunnel_id, cause
            ),
            _ => info!(
                "Control connection from {} closed (tunnel {:?})",
                peer_addr, tunnel_id
            ),
        }
    }

    async fn dispatch(
        &self,
        control: &ControlChannel,
        state: &mut ConnectionState,
        msg: ProtoMessage,
    ) -> ControlFlow<()> {
        match msg.kind {
            MessageType::Ping => {
                let _ = control.send(ProtoMessage::pong());
            }
            MessageType::Pong => trace!("Pong from {}", state.peer_addr),
            MessageType::Request => return self.on_request(control, state, &msg.data).await,
            MessageType::Transfer => on_transfer(state, msg),
            MessageType::RemoteDisconnect | MessageType::LocalDisconnect => {
                on_disconnect(state, &msg)
            }
            MessageType::LocalConnected => {
                if let Ok(head) = msg.session_head() {
                    debug!("Session {}:{} reached local service", head.tunnel_id, head.session_id);
                }
            }
            MessageType::ForceOffReply => {
                info!("Tunnel {:?} acknowledged force-off", state.tunnel_id());
                control.close();
                return ControlFlow::Break(());
            }
            MessageType::Handshake => {
                warn!("Unexpected HANDSHAKE from {}", state.peer_addr);
                control.fail("handshake after start of session");
                return ControlFlow::Break(());
            }
            MessageType::Unknown(code) => debug!("Ignoring unknown message type {}", code),
            other => debug!("Ignoring {:?} from {}", other, state.peer_addr),
        }
        ControlFlow::Continue(())
    }

    async fn on_request(
        &self,
        control: &ControlChannel,
        state: &mut ConnectionState,
        data: &[u8],
    ) -> ControlFlow<()> {
        if let Some(tunnel_id) = state.tunnel_id() {
            warn!(
                "Second REQUEST from {} while tunnel {} is active, closing",
                state.peer_addr, tunnel_id
            );
            let _ = control.send(ProtoMessage::response_err(
                "a tunnel is already registered on this connection",
            ));
            control.close();
            return ControlFlow::Break(());
        }

        match self.admit(control, state, data).await {
            Ok((tunnel, confirmed)) => {
                let tunnel_id = tunnel.fd.tunnel_id();
                let request = tunnel.fd.request();
                info!(
                    "Tunnel {} registered: {} -> {} for {}",
                    tunnel_id,
                    request.public_endpoint(),
                    request.local_endpoint(),
                    state.peer_addr
                );
                state.tunnel = Some(tunnel);
                if control
                    .send(ProtoMessage::response_ok(tunnel_id, confirmed))
                    .is_err()
                {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            Err(e) => {
                warn!("Rejected tunnel request from {}: {}", state.peer_addr, e);
                let _ = control.send(ProtoMessage::response_err(&e.to_string()));
                control.close();
                ControlFlow::Break(())
            }
        }
    }

    async fn admit(
        &self,
        control: &ControlChannel,
        state: &ConnectionState,
        data: &[u8],
    ) -> Result<(ActiveTunnel, Bytes), AdmissionError> {
        if self.require_encryption && !state.encrypted {
            return Err(AdmissionError::EncryptionRequired);
        }

        let request =
            TunnelRequest::from_bytes(data).map_err(|e| AdmissionError::Malformed(e.to_string()))?;
        debug!("REQUEST from {}: {}", state.peer_addr, request);

        let confirmed = self.interceptor.intercept(&request).await?;
        let reply = confirmed
            .to_bytes()
            .map_err(|e| AdmissionError::Malformed(e.to_string()))?;

        let key = match confirmed.tunnel_type {
            TunnelType::Tcp => TunnelKey::Tcp(confirmed.remote_port),
            TunnelType::Http => TunnelKey::Http(confirmed.vhost.clone().unwrap_or_default()),
            TunnelType::Https => TunnelKey::Https(confirmed.vhost.clone().unwrap_or_default()),
        };

        let sessions = Arc::new(SessionChannels::new(
            next_tunnel_id(),
            confirmed,
            control.clone(),
        ));
        let registered = match &key {
            TunnelKey::Tcp(port) => self.tcp.register(*port, sessions),
            TunnelKey::Http(vhost) => self.http.register(vhost, sessions),
            TunnelKey::Https(vhost) => self.https.register(vhost, sessions),
        };

        match registered {
            Ok(fd) => Ok((ActiveTunnel { key, fd }, reply)),
            Err(RegistryError::Closed) => Err(AdmissionError::ShuttingDown),
            Err(e) => {
                debug!("Registration failed: {}", e);
                Err(match key {
                    TunnelKey::Tcp(port) => AdmissionError::PortInUse(port),
                    TunnelKey::Http(vhost) | TunnelKey::Https(vhost) => {
                        AdmissionError::VhostInUse(vhost)
                    }
                })
            }
        }
    }

    async fn release(&self, tunnel: ActiveTunnel) {
        let tunnel_id = tunnel.fd.tunnel_id();
        let removed = match &tunnel.key {
            TunnelKey::Tcp(port) => self.tcp.unregister_tunnel(*port, tunnel_id).await,
            TunnelKey::Http(vhost) => self.http.unregister_tunnel(vhost, tunnel_id),
            TunnelKey::Https(vhost) => self.https.unregister_tunnel(vhost, tunnel_id),
        };
        if removed.is_none() {
            // Already swept by a registry shutdown
            tunnel.fd.close();
        }
        debug!("Released tunnel {} ({:?})", tunnel_id, tunnel.key);
    }
}

fn on_transfer(state: &ConnectionState, msg: ProtoMessage) {
    let Some(tunnel) = &state.tunnel else {
        debug!("TRANSFER from {} before registration", state.peer_addr);
        return;
    };
    let head = match msg.session_head() {
        Ok(head) => head,
        Err(e) => {
            error!("Bad TRANSFER head from {}: {}", state.peer_addr, e);
            return;
        }
    };
    if head.tunnel_id != tunnel.fd.tunnel_id() {
        debug!("TRANSFER for foreign tunnel {}", head.tunnel_id);
        return;
    }

    match tunnel.fd.sessions().get(head.session_id) {
        Some(peer) => {
            trace!("Session {}:{} <- {} bytes", head.tunnel_id, head.session_id, msg.data.len());
            peer.send(msg.data);
        }
        None => trace!("Dropping TRANSFER for gone session {}", head.session_id),
    }
}

fn on_disconnect(state: &ConnectionState, msg: &ProtoMessage) {
    let (Some(tunnel), Ok(head)) = (&state.tunnel, msg.session_head()) else {
        return;
    };
    if head.tunnel_id != tunnel.fd.tunnel_id() {
        return;
    }
    if let Some(peer) = tunnel.fd.sessions().remove(head.session_id) {
        debug!("Session {}:{} closed by client", head.tunnel_id, head.session_id);
        peer.close();
    }
}
