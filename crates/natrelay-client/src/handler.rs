//! Client side of the control channel

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use natrelay_proto::{
    ClientHandshake, CloseCause, ControlChannel, ControlStream, FrameCodec, HandshakeError,
    MessageType, PayloadCodec, ProtoMessage, TunnelRequest,
};
use natrelay_router::SessionChannels;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::connector::LocalConnector;
use crate::error::ClientError;

/// How a registered tunnel's control connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server forced the tunnel off; never followed by a reconnect
    ForceOff,
    /// The owner asked to stop
    Shutdown,
    /// The connection went away
    Closed(CloseCause),
}

/// Aborts a channel abandoned before registration completed
struct PendingChannel(Option<ControlChannel>);

impl PendingChannel {
    fn disarm(mut self) -> Option<ControlChannel> {
        self.0.take()
    }
}

impl Drop for PendingChannel {
    fn drop(&mut self) {
        if let Some(control) = self.0.take() {
            control.abort();
        }
    }
}

/// A tunnel the server has accepted
pub struct ConnectedTunnel {
    control: ControlChannel,
    inbound: UnboundedReceiver<ProtoMessage>,
    sessions: Arc<SessionChannels>,
    connector: LocalConnector,
}

impl std::fmt::Debug for ConnectedTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedTunnel")
            .field("tunnel_id", &self.sessions.tunnel_id())
            .field("local", &self.connector.target())
            .finish()
    }
}

/// Dial the server, negotiate payload hardening and register `request`
pub async fn connect(
    config: &ClientConfig,
    request: &TunnelRequest,
) -> Result<ConnectedTunnel, ClientError> {
    let addr = config.server_addr();
    let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(ClientError::Connect {
                addr,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(ClientError::Connect {
                addr,
                reason: "timed out".to_string(),
            })
        }
    };
    let _ = stream.set_nodelay(true);
    debug!("Connected to {}", addr);

    match &config.tls {
        Some(connector) => {
            let name = config
                .tls_server_name
                .clone()
                .unwrap_or_else(|| config.server_host.clone());
            let server_name = ServerName::try_from(name)
                .map_err(|e| ClientError::Tls(format!("Invalid server name: {}", e)))?;
            let stream = match tokio::time::timeout(
                config.connect_timeout,
                connector.connect(server_name, stream),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(ClientError::Tls(e.to_string())),
                Err(_) => return Err(ClientError::Tls("timed out".to_string())),
            };
            register(Framed::new(stream, FrameCodec::new()), config, request).await
        }
        None => register(Framed::new(stream, FrameCodec::new()), config, request).await,
    }
}

async fn register<S: ControlStream>(
    mut framed: Framed<S, FrameCodec>,
    config: &ClientConfig,
    request: &TunnelRequest,
) -> Result<ConnectedTunnel, ClientError> {
    let read_timeout = config.channel.read_timeout;

    let payload = if config.wants_handshake() {
        let handshake = ClientHandshake::new(config.compress, config.encrypt);
        framed
            .send(ProtoMessage::handshake(handshake.hello()))
            .await?;

        let reply = match tokio::time::timeout(read_timeout, framed.next()).await {
            Ok(Some(reply)) => reply?,
            Ok(None) | Err(_) => return Err(ClientError::ChannelClosed),
        };
        if reply.kind != MessageType::Handshake {
            return Err(HandshakeError::Malformed(format!("unexpected {:?}", reply.kind)).into());
        }
        handshake.finish(&reply.data)?
    } else {
        PayloadCodec::plain()
    };

    let (control, mut inbound) = ControlChannel::spawn(framed, payload, config.channel.clone());
    let pending = PendingChannel(Some(control.clone()));

    control.send(ProtoMessage::request(request.to_bytes()?))?;

    loop {
        let msg = match tokio::time::timeout(read_timeout, inbound.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) | Err(_) => return Err(ClientError::ChannelClosed),
        };

        match msg.kind {
            MessageType::ResponseOk => {
                let tunnel_id = msg.session_head()?.tunnel_id;
                let confirmed = TunnelRequest::from_bytes(&msg.data)?;
                info!(
                    "Tunnel {} registered: {} -> {}",
                    tunnel_id,
                    confirmed.public_endpoint(),
                    confirmed.local_endpoint()
                );

                let connector =
                    LocalConnector::new(confirmed.local_endpoint(), config.local_dial_timeout);
                let control = pending.disarm().unwrap_or(control);
                let sessions = Arc::new(SessionChannels::new(tunnel_id, confirmed, control.clone()));
                return Ok(ConnectedTunnel {
                    control,
                    inbound,
                    sessions,
                    connector,
                });
            }
            MessageType::ResponseErr => {
                let reason = msg.data_text();
                warn!("Tunnel request rejected: {}", reason);
                if let Some(control) = pending.disarm() {
                    control.close();
                }
                return Err(ClientError::Rejected(reason));
            }
            MessageType::Ping => {
                let _ = control.send(ProtoMessage::pong());
            }
            other => debug!("Ignoring {:?} while awaiting response", other),
        }
    }
}

impl ConnectedTunnel {
    pub fn tunnel_id(&self) -> u64 {
        self.sessions.tunnel_id()
    }

    /// The request as confirmed by the server (assigned port, normalized vhost)
    pub fn request(&self) -> &TunnelRequest {
        self.sessions.request()
    }

    pub fn abort(&self) {
        self.control.abort();
        self.sessions.force_close_all();
    }

    /// Serve sessions until the connection ends or `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) -> SessionEnd {
        let end = loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.control.abort();
                    break SessionEnd::Shutdown;
                }
                msg = self.inbound.recv() => msg,
            };

            let Some(msg) = msg else {
                break SessionEnd::Closed(self.control.cause().unwrap_or(CloseCause::Clean));
            };

            if let Some(end) = self.dispatch(msg).await {
                break end;
            }
        };

        self.sessions.force_close_all();
        debug!("Tunnel {} ended: {:?}", self.tunnel_id(), end);
        end
    }

    async fn dispatch(&self, msg: ProtoMessage) -> Option<SessionEnd> {
        match msg.kind {
            MessageType::Ping => {
                let _ = self.control.send(ProtoMessage::pong());
            }
            MessageType::Pong => trace!("Pong"),
            MessageType::Transfer => {
                let head = self.own_session(&msg)?;
                trace!("Session {} -> {} bytes", head, msg.data.len());
                self.connector.deliver(&self.sessions, head, msg.data);
            }
            MessageType::RemoteConnected => {
                let head = self.own_session(&msg)?;
                debug!("Remote peer {} opened session {}", msg.data_text(), head);
                if self.sessions.get(head).is_none() {
                    self.connector.open(&self.sessions, head);
                }
            }
            MessageType::RemoteDisconnect => {
                let head = self.own_session(&msg)?;
                if let Some(peer) = self.sessions.remove(head) {
                    debug!("Remote peer closed session {}", head);
                    peer.close();
                }
            }
            MessageType::ForceOff => {
                info!("Tunnel {} forced off by server", self.tunnel_id());
                self.sessions.force_close_all();
                let _ = self
                    .control
                    .send(ProtoMessage::force_off_reply(self.tunnel_id()));
                self.control.close();
                self.control.closed().await;
                return Some(SessionEnd::ForceOff);
            }
            MessageType::ResponseErr => {
                // The server closes the connection right after
                warn!("Server reported: {}", msg.data_text());
            }
            MessageType::Unknown(code) => debug!("Ignoring unknown message type {}", code),
            other => debug!("Ignoring {:?} from server", other),
        }
        None
    }

    /// Session id of a message addressed to this tunnel
    fn own_session(&self, msg: &ProtoMessage) -> Option<u64> {
        let head = msg.session_head().ok()?;
        if head.tunnel_id != self.tunnel_id() {
            debug!("{:?} for foreign tunnel {}", msg.kind, head.tunnel_id);
            return None;
        }
        Some(head.session_id)
    }
}
