//! Relay server: registries, listeners and the control handler wired together

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use natrelay_proto::{ChannelConfig, PortRange};
use natrelay_router::{HttpRegistry, TcpRegistry};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::acceptor::RemotePeerAcceptor;
use crate::handler::TunnelHandler;
use crate::http::{HttpListener, HttpPlugin};
use crate::interceptor::{DefaultRequestInterceptor, TunnelRequestInterceptor};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("{0} requires a TLS certificate and key")]
    TlsRequired(&'static str),
}

/// Listener addresses and admission policy
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub control_addr: SocketAddr,
    pub tls_control_addr: Option<SocketAddr>,
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    /// Address TCP tunnel ports are bound on
    pub tunnel_bind_addr: IpAddr,
    pub port_range: PortRange,
    pub auth_token: Option<String>,
    pub require_encryption: bool,
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([0, 0, 0, 0], 4443)),
            tls_control_addr: None,
            http_addr: None,
            https_addr: None,
            tunnel_bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: PortRange::default(),
            auth_token: None,
            require_encryption: false,
            channel: ChannelConfig::default(),
        }
    }
}

/// A server whose sockets are bound but not yet serving
pub struct RelayServer {
    handler: Arc<TunnelHandler>,
    control: TcpListener,
    tls_control: Option<(TcpListener, TlsAcceptor)>,
    http: Option<(TcpListener, HttpListener)>,
    https: Option<(TcpListener, HttpListener)>,
}

impl RelayServer {
    pub async fn bind(config: ServerConfig, tls: Option<TlsAcceptor>) -> Result<Self, ServerError> {
        let tcp = Arc::new(TcpRegistry::with_bind_addr(
            config.tunnel_bind_addr,
            Arc::new(RemotePeerAcceptor),
        ));
        let http = Arc::new(HttpRegistry::http());
        let https = Arc::new(HttpRegistry::https());

        let mut interceptor = DefaultRequestInterceptor::new(config.port_range.clone(), tcp.clone())
            .with_vhost_listeners(config.http_addr.is_some(), config.https_addr.is_some());
        if let Some(token) = &config.auth_token {
            interceptor = interceptor.with_auth_token(token.clone());
        }
        let interceptor: Arc<dyn TunnelRequestInterceptor> = Arc::new(interceptor);

        let handler = Arc::new(
            TunnelHandler::new(tcp, http.clone(), https.clone(), interceptor)
                .with_channel_config(config.channel.clone())
                .with_require_encryption(config.require_encryption),
        );

        let control = bind(config.control_addr).await?;

        let tls_control = match config.tls_control_addr {
            Some(addr) => {
                let acceptor = tls.clone().ok_or(ServerError::TlsRequired("TLS control listener"))?;
                Some((bind(addr).await?, acceptor))
            }
            None => None,
        };

        let http = match config.http_addr {
            Some(addr) => Some((bind(addr).await?, HttpListener::new(http))),
            None => None,
        };

        let https = match config.https_addr {
            Some(addr) => {
                let acceptor = tls.ok_or(ServerError::TlsRequired("HTTPS listener"))?;
                Some((bind(addr).await?, HttpListener::new(https).with_tls(acceptor)))
            }
            None => None,
        };

        Ok(Self {
            handler,
            control,
            tls_control,
            http,
            https,
        })
    }

    /// Static content responder for both HTTP and HTTPS listeners
    pub fn with_http_plugin(mut self, plugin: Arc<dyn HttpPlugin>) -> Self {
        self.http = self
            .http
            .map(|(socket, listener)| (socket, listener.with_plugin(plugin.clone())));
        self.https = self
            .https
            .map(|(socket, listener)| (socket, listener.with_plugin(plugin)));
        self
    }

    pub fn handler(&self) -> &Arc<TunnelHandler> {
        &self.handler
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr().ok()
    }

    pub fn tls_control_addr(&self) -> Option<SocketAddr> {
        self.tls_control.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    /// Serve until `shutdown` fires, then unregister every tunnel
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tasks = Vec::new();
        let mut http_listeners = Vec::new();

        tasks.push(tokio::spawn(self.handler.clone().serve(self.control, None)));
        if let Some((socket, acceptor)) = self.tls_control {
            tasks.push(tokio::spawn(
                self.handler.clone().serve(socket, Some(acceptor)),
            ));
        }
        for (socket, listener) in self.http.into_iter().chain(self.https) {
            let listener = Arc::new(listener);
            http_listeners.push(listener.clone());
            tasks.push(tokio::spawn(listener.serve(socket)));
        }

        shutdown.cancelled().await;
        info!("Shutting down relay server");

        self.handler.shutdown();
        for listener in &http_listeners {
            listener.shutdown();
        }
        for task in tasks {
            let _ = task.await;
        }

        self.handler.tcp_registry().shutdown().await;
        self.handler.http_registry().shutdown();
        self.handler.https_registry().shutdown();
        info!("Relay server stopped");
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}
