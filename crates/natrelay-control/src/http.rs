//! Shared HTTP/HTTPS listener routing requests to vhost tunnels
//!
//! Per connection: parse the request head, let the plugin answer if it
//! wants to, look the vhost up, run the tunnel's HTTP interceptor, then hand
//! the connection to the tunnel as a new session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use natrelay_http_auth::{
    simple_response, DefaultHttpInterceptor, HttpParseError, HttpRequestHead,
    HttpRequestInterceptor,
};
use natrelay_proto::ProtoMessage;
use natrelay_router::{normalize_host, relay, HttpRegistry, PeerHandle, RelaySide};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Content responder consulted before any vhost lookup
#[async_trait]
pub trait HttpPlugin: Send + Sync {
    /// A complete HTTP response to answer with, or `None` to route the
    /// request to its tunnel
    async fn handle(&self, head: &HttpRequestHead) -> Option<Vec<u8>>;
}

pub struct HttpListener {
    registry: Arc<HttpRegistry>,
    interceptor: Arc<dyn HttpRequestInterceptor>,
    plugin: Option<Arc<dyn HttpPlugin>>,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
}

impl HttpListener {
    pub fn new(registry: Arc<HttpRegistry>) -> Self {
        Self {
            registry,
            interceptor: Arc::new(DefaultHttpInterceptor),
            plugin: None,
            tls: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn HttpRequestInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn HttpPlugin>) -> Self {
        self.plugin = Some(plugin);
        self
    }

    /// Terminate TLS on every accepted connection (HTTPS)
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn registry(&self) -> &Arc<HttpRegistry> {
        &self.registry
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let scheme = if self.tls.is_some() { "HTTPS" } else { "HTTP" };
        if let Ok(addr) = listener.local_addr() {
            info!("{} listener on {}", scheme, addr);
        }

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept {} connection: {}", scheme, e);
                        continue;
                    }
                },
            };
            let local_addr = match stream.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    debug!("Dropping {}: {}", remote_addr, e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let this = self.clone();
            tokio::spawn(async move {
                let Some(acceptor) = this.tls.clone() else {
                    this.handle_connection(stream, local_addr, remote_addr).await;
                    return;
                };
                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(stream)) => this.handle_connection(stream, local_addr, remote_addr).await,
                    Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", remote_addr, e),
                    Err(_) => debug!("TLS handshake with {} timed out", remote_addr),
                }
            });
        }

        debug!("{} listener stopped", scheme);
    }

    /// Serve one inbound HTTP connection
    pub async fn handle_connection<S>(&self, mut stream: S, local_addr: SocketAddr, remote_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = BytesMut::with_capacity(4096);
        let (mut head, consumed) = loop {
            match HttpRequestHead::parse(&buf) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) => {}
                Err(e) => {
                    debug!("Bad request from {}: {}", remote_addr, e);
                    let body = match e {
                        HttpParseError::TooLarge(_) => "request head too large",
                        HttpParseError::Malformed(_) => "malformed request",
                    };
                    respond(&mut stream, &simple_response(400, "Bad Request", body)).await;
                    return;
                }
            }

            match tokio::time::timeout(HEAD_READ_TIMEOUT, stream.read_buf(&mut buf)).await {
                Ok(Ok(0)) => {
                    trace!("{} closed before sending a request", remote_addr);
                    return;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("Read from {} failed: {}", remote_addr, e);
                    return;
                }
                Err(_) => {
                    debug!("Timed out waiting for request head from {}", remote_addr);
                    return;
                }
            }
        };

        let Some(host) = head.host().map(normalize_host).filter(|h| !h.is_empty()) else {
            respond(&mut stream, &simple_response(400, "Bad Request", "missing Host header")).await;
            return;
        };

        if let Some(plugin) = &self.plugin {
            if let Some(response) = plugin.handle(&head).await {
                trace!("Plugin answered {} {} for {}", head.method, head.path, host);
                respond(&mut stream, &response).await;
                return;
            }
        }

        let Some(fd) = self.registry.lookup(&host) else {
            debug!("No tunnel for vhost {}", host);
            respond(&mut stream, &simple_response(403, "Forbidden", "vhost not registered")).await;
            return;
        };

        if let Some(response) = self
            .interceptor
            .handle(local_addr, remote_addr, fd.request(), &mut head)
        {
            respond(&mut stream, &response).await;
            return;
        }

        if !head.is_upgrade() {
            head.set_header("Connection", "close");
        }

        let peer = remote_addr.to_string();
        let (handle, receiver) = PeerHandle::new(peer.clone());
        let sessions = fd.sessions().clone();
        let session_id = match sessions.put(handle) {
            Ok(id) => id,
            Err(e) => {
                debug!("Tunnel for {} closing: {}", host, e);
                respond(
                    &mut stream,
                    &simple_response(503, "Service Unavailable", "tunnel closing"),
                )
                .await;
                return;
            }
        };

        let mut first = head.to_bytes();
        first.extend_from_slice(&buf[consumed..]);
        fd.stats().add_inbound(first.len());

        let session = sessions.head(session_id);
        let control = sessions.control();
        if control
            .send(ProtoMessage::remote_connected(session, &peer))
            .is_err()
            || control
                .send(ProtoMessage::transfer(session, Bytes::from(first)))
                .is_err()
        {
            sessions.remove(session_id);
            return;
        }

        debug!(
            "{} {} {} -> session {}:{}",
            host, head.method, head.path, session.tunnel_id, session_id
        );
        relay(
            stream,
            session_id,
            receiver,
            sessions,
            RelaySide::Remote,
            Some(fd.stats().clone()),
        )
        .await;
    }
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, response: &[u8]) {
    if let Err(e) = stream.write_all(response).await {
        debug!("Failed to write local response: {}", e);
        return;
    }
    let _ = stream.shutdown().await;
}
