//! Tunnel request admission

use std::sync::Arc;

use async_trait::async_trait;
use natrelay_proto::{PortRange, TunnelRequest, TunnelType};
use natrelay_router::{normalize_host, TcpRegistry};
use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Reasons a REQUEST is refused. The message is sent verbatim in RESPONSE_ERR.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("invalid auth token")]
    InvalidToken,

    #[error("port {0} is not allowed")]
    PortNotAllowed(u16),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("no free port in {0}")]
    NoFreePort(String),

    #[error("vhost is required for {0} tunnels")]
    MissingVhost(TunnelType),

    #[error("{0} tunnels are not served by this server")]
    NotServed(TunnelType),

    #[error("vhost {0} is already in use")]
    VhostInUse(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("encryption is required by this server")]
    EncryptionRequired,

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Admission control applied to every REQUEST before registration.
///
/// Returns the request the tunnel will actually be registered with, which
/// may differ from the one sent (assigned port, normalized vhost).
#[async_trait]
pub trait TunnelRequestInterceptor: Send + Sync {
    async fn intercept(&self, request: &TunnelRequest) -> Result<TunnelRequest, AdmissionError>;
}

/// Static token check plus TCP port assignment from an allowed range
pub struct DefaultRequestInterceptor {
    auth_token: Option<String>,
    port_range: PortRange,
    tcp: Arc<TcpRegistry>,
    serves_http: bool,
    serves_https: bool,
}

impl DefaultRequestInterceptor {
    pub fn new(port_range: PortRange, tcp: Arc<TcpRegistry>) -> Self {
        Self {
            auth_token: None,
            port_range,
            tcp,
            serves_http: true,
            serves_https: true,
        }
    }

    /// Which vhost listeners exist; tunnels nobody can reach are refused
    pub fn with_vhost_listeners(mut self, http: bool, https: bool) -> Self {
        self.serves_http = http;
        self.serves_https = https;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn port_range(&self) -> &PortRange {
        &self.port_range
    }

    fn check_token(&self, given: Option<&str>) -> Result<(), AdmissionError> {
        let Some(expected) = self.auth_token.as_deref() else {
            return Ok(());
        };
        let given = given.unwrap_or("").as_bytes();
        let expected = expected.as_bytes();

        let mut diff = (given.len() != expected.len()) as u8;
        for (i, byte) in expected.iter().enumerate() {
            diff |= byte ^ given.get(i).copied().unwrap_or(0);
        }

        if diff == 0 {
            Ok(())
        } else {
            Err(AdmissionError::InvalidToken)
        }
    }

    fn allocate_port(&self) -> Result<u16, AdmissionError> {
        let offset = rand::thread_rng().gen_range(0..self.port_range.len().max(1));
        self.port_range
            .iter_from(offset)
            .find(|port| !self.tcp.contains(*port) && self.tcp.is_port_bindable(*port))
            .ok_or_else(|| AdmissionError::NoFreePort(self.port_range.to_string()))
    }
}

#[async_trait]
impl TunnelRequestInterceptor for DefaultRequestInterceptor {
    async fn intercept(&self, request: &TunnelRequest) -> Result<TunnelRequest, AdmissionError> {
        self.check_token(request.auth_token.as_deref())?;

        match request.tunnel_type {
            TunnelType::Tcp if request.remote_port == 0 => {
                let port = self.allocate_port()?;
                debug!("Assigned port {} for {}", port, request.local_endpoint());
                Ok(request.with_remote_port(port))
            }
            TunnelType::Tcp => {
                let port = request.remote_port;
                if !self.port_range.contains(port) {
                    return Err(AdmissionError::PortNotAllowed(port));
                }
                if self.tcp.contains(port) {
                    return Err(AdmissionError::PortInUse(port));
                }
                Ok(request.clone())
            }
            TunnelType::Http if !self.serves_http => {
                Err(AdmissionError::NotServed(TunnelType::Http))
            }
            TunnelType::Https if !self.serves_https => {
                Err(AdmissionError::NotServed(TunnelType::Https))
            }
            TunnelType::Http | TunnelType::Https => {
                let vhost = request
                    .vhost
                    .as_deref()
                    .map(normalize_host)
                    .filter(|v| !v.is_empty())
                    .ok_or(AdmissionError::MissingVhost(request.tunnel_type))?;
                Ok(request.with_vhost(vhost))
            }
        }
    }
}
