//! Client configuration

use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

use natrelay_proto::ChannelConfig;
use tokio_rustls::TlsConnector;

/// Which disconnects are followed by a reconnect.
///
/// Loss is an orderly close of the control connection; error is a transport
/// or protocol failure, including failing to connect at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryPolicy(u8);

impl RetryPolicy {
    pub const NEVER: Self = Self(0);
    pub const ON_LOSS: Self = Self(0b01);
    pub const ON_ERROR: Self = Self(0b10);
    pub const ALWAYS: Self = Self(0b11);

    pub fn from_flags(on_loss: bool, on_error: bool) -> Self {
        let mut policy = Self::NEVER;
        if on_loss {
            policy = policy | Self::ON_LOSS;
        }
        if on_error {
            policy = policy | Self::ON_ERROR;
        }
        policy
    }

    pub fn retries_on_loss(&self) -> bool {
        self.0 & Self::ON_LOSS.0 != 0
    }

    pub fn retries_on_error(&self) -> bool {
        self.0 & Self::ON_ERROR.0 != 0
    }

    /// Decide for one disconnect
    pub fn should_retry(&self, error: bool) -> bool {
        if error {
            self.retries_on_error()
        } else {
            self.retries_on_loss()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ALWAYS
    }
}

impl BitOr for RetryPolicy {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Connection settings shared by every attempt of a tunnel
#[derive(Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    /// TLS-wrap the control connection
    pub tls: Option<TlsConnector>,
    /// Name checked against the server certificate; defaults to `server_host`
    pub tls_server_name: Option<String>,
    pub encrypt: bool,
    pub compress: bool,
    pub retry: RetryPolicy,
    pub backoff: Duration,
    pub connect_timeout: Duration,
    /// Timeout for reaching the local service of a session
    pub local_dial_timeout: Duration,
    pub channel: ChannelConfig,
}

impl ClientConfig {
    pub fn new(server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            tls: None,
            tls_server_name: None,
            encrypt: false,
            compress: false,
            retry: RetryPolicy::default(),
            backoff: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            local_dial_timeout: Duration::from_secs(10),
            channel: ChannelConfig::default(),
        }
    }

    pub fn with_tls(mut self, connector: TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    pub fn with_tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Whether a HANDSHAKE precedes the REQUEST
    pub fn wants_handshake(&self) -> bool {
        self.encrypt || self.compress
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server_addr())
            .field("tls", &self.tls.is_some())
            .field("encrypt", &self.encrypt)
            .field("compress", &self.compress)
            .field("retry", &self.retry)
            .field("backoff", &self.backoff)
            .finish()
    }
}
