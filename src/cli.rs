//! Command line interface

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use natrelay_client::RetryPolicy;
use natrelay_control::ServerConfig;
use natrelay_proto::{ChannelConfig, PortRange, TunnelRequest, TunnelType};

use crate::config::{self, BasicAuthSpec, ClientFile, ServerFile, TunnelSpec};

/// natrelay - expose services behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "natrelay")]
#[command(version)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "NATRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the public relay server
    Server(ServerArgs),
    /// Register tunnels with a relay and serve them from local services
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// JSON config file; flags override its values
    #[arg(long, env = "NATRELAY_SERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Control listener for tunnel clients [default: 0.0.0.0:4443]
    #[arg(long, env = "NATRELAY_CONTROL_ADDR")]
    pub control_addr: Option<String>,

    /// TLS control listener (needs --tls-cert and --tls-key)
    #[arg(long, env = "NATRELAY_TLS_CONTROL_ADDR")]
    pub tls_control_addr: Option<String>,

    /// Shared HTTP listener for vhost tunnels
    #[arg(long, env = "NATRELAY_HTTP_ADDR")]
    pub http_addr: Option<String>,

    /// Shared HTTPS listener for vhost tunnels (needs --tls-cert and --tls-key)
    #[arg(long, env = "NATRELAY_HTTPS_ADDR")]
    pub https_addr: Option<String>,

    /// Certificate chain, PEM
    #[arg(long, env = "NATRELAY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Private key, PEM
    #[arg(long, env = "NATRELAY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Allowed TCP tunnel ports, e.g. "1024-65535" or "8000,9000-9100"
    #[arg(long, env = "NATRELAY_PORT_RANGE")]
    pub port_range: Option<String>,

    /// Address public TCP tunnel ports bind on [default: 0.0.0.0]
    #[arg(long, env = "NATRELAY_TUNNEL_BIND_ADDR")]
    pub tunnel_bind_addr: Option<String>,

    /// Token clients must present
    #[arg(long, env = "NATRELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Reject clients that did not negotiate payload encryption
    #[arg(long, env = "NATRELAY_REQUIRE_ENCRYPTION")]
    pub require_encryption: bool,

    /// Runtime worker threads [default: number of cores]
    #[arg(long, env = "NATRELAY_WORKERS")]
    pub workers: Option<usize>,

    /// Send a keepalive after this many idle seconds [default: 20]
    #[arg(long, env = "NATRELAY_IDLE_SECONDS")]
    pub idle_seconds: Option<u64>,

    /// Drop a control connection silent for this many seconds [default: 60]
    #[arg(long, env = "NATRELAY_WATCHDOG_SECONDS")]
    pub watchdog_seconds: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// JSON config file; flags override its values
    #[arg(long, env = "NATRELAY_CLIENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Relay host
    #[arg(long, env = "NATRELAY_SERVER_HOST")]
    pub server_host: Option<String>,

    /// Relay control port [default: 4443]
    #[arg(long, env = "NATRELAY_SERVER_PORT")]
    pub server_port: Option<u16>,

    /// Wrap the control connection in TLS
    #[arg(long, env = "NATRELAY_TLS")]
    pub tls: bool,

    /// CA certificate to trust instead of the bundled web roots
    #[arg(long, env = "NATRELAY_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// Name to verify the relay certificate against [default: server host]
    #[arg(long, env = "NATRELAY_TLS_SERVER_NAME")]
    pub tls_server_name: Option<String>,

    /// Encrypt tunnel payloads
    #[arg(long, env = "NATRELAY_ENCRYPT")]
    pub encrypt: bool,

    /// Compress tunnel payloads
    #[arg(long, env = "NATRELAY_COMPRESS")]
    pub compress: bool,

    /// Reconnect after the relay closed the connection [default: true]
    #[arg(long, env = "NATRELAY_RETRY_ON_LOSS")]
    pub retry_on_loss: Option<bool>,

    /// Reconnect after connection errors [default: true]
    #[arg(long, env = "NATRELAY_RETRY_ON_ERROR")]
    pub retry_on_error: Option<bool>,

    /// Seconds between reconnect attempts [default: 3]
    #[arg(long, env = "NATRELAY_BACKOFF_SECONDS")]
    pub backoff_seconds: Option<u64>,

    /// Runtime worker threads [default: number of cores]
    #[arg(long, env = "NATRELAY_WORKERS")]
    pub workers: Option<usize>,

    /// Tunnel kind: tcp, http or https
    #[arg(long = "type", env = "NATRELAY_TUNNEL_TYPE", default_value = "tcp")]
    pub tunnel_type: TunnelType,

    /// Tunnel display name
    #[arg(long, env = "NATRELAY_TUNNEL_NAME")]
    pub name: Option<String>,

    /// Local service host
    #[arg(long, env = "NATRELAY_LOCAL_ADDR", default_value = "127.0.0.1")]
    pub local_addr: String,

    /// Local service port; when given, this tunnel replaces the config file's tunnels
    #[arg(long, env = "NATRELAY_LOCAL_PORT")]
    pub local_port: Option<u16>,

    /// Public TCP port, 0 lets the relay pick one
    #[arg(long, env = "NATRELAY_REMOTE_PORT", default_value_t = 0)]
    pub remote_port: u16,

    /// Virtual host for http/https tunnels
    #[arg(long, env = "NATRELAY_VHOST")]
    pub vhost: Option<String>,

    /// Token presented to the relay
    #[arg(long, env = "NATRELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Require HTTP basic auth, as USER:PASSWORD
    #[arg(long, env = "NATRELAY_BASIC_AUTH")]
    pub basic_auth: Option<String>,

    /// Replace a request header, NAME=VALUE ($remote_addr expands to the peer IP)
    #[arg(long = "set-header", value_parser = config::parse_header)]
    pub set_headers: Vec<(String, String)>,

    /// Append a request header, NAME=VALUE
    #[arg(long = "add-header", value_parser = config::parse_header)]
    pub add_headers: Vec<(String, String)>,
}

/// Everything `natrelay server` needs after merging flags and file
#[derive(Debug)]
pub struct ServerSettings {
    pub server: ServerConfig,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub workers: Option<usize>,
}

impl ServerArgs {
    pub fn resolve(self) -> Result<ServerSettings> {
        let file: ServerFile = config::load_or_default(self.config.as_deref())?;
        let defaults = ServerConfig::default();

        let control_addr = match self.control_addr.or(file.control_addr) {
            Some(addr) => parse_addr(&addr, "control address")?,
            None => defaults.control_addr,
        };
        let tls_control_addr = self
            .tls_control_addr
            .or(file.tls_control_addr)
            .map(|addr| parse_addr(&addr, "TLS control address"))
            .transpose()?;
        let http_addr = self
            .http_addr
            .or(file.http_addr)
            .map(|addr| parse_addr(&addr, "HTTP address"))
            .transpose()?;
        let https_addr = self
            .https_addr
            .or(file.https_addr)
            .map(|addr| parse_addr(&addr, "HTTPS address"))
            .transpose()?;
        let tunnel_bind_addr = match self.tunnel_bind_addr.or(file.tunnel_bind_addr) {
            Some(addr) => addr
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid tunnel bind address '{}'", addr))?,
            None => defaults.tunnel_bind_addr,
        };
        let port_range = match self.port_range.or(file.port_range) {
            Some(expr) => PortRange::parse(&expr)
                .with_context(|| format!("Invalid port range '{}'", expr))?,
            None => defaults.port_range,
        };

        let mut channel = ChannelConfig::default();
        if let Some(secs) = self.idle_seconds.or(file.idle_seconds) {
            channel.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.watchdog_seconds.or(file.watchdog_seconds) {
            channel.read_timeout = Duration::from_secs(secs);
        }
        if channel.read_timeout <= channel.ping_interval {
            bail!("Watchdog must be longer than the idle keepalive interval");
        }

        let tls_cert = self.tls_cert.or(file.tls_cert);
        let tls_key = self.tls_key.or(file.tls_key);
        if tls_cert.is_some() != tls_key.is_some() {
            bail!("--tls-cert and --tls-key must be given together");
        }

        Ok(ServerSettings {
            server: ServerConfig {
                control_addr,
                tls_control_addr,
                http_addr,
                https_addr,
                tunnel_bind_addr,
                port_range,
                auth_token: self.auth_token.or(file.auth_token),
                require_encryption: self.require_encryption
                    || file.require_encryption.unwrap_or(false),
                channel,
            },
            tls_cert,
            tls_key,
            workers: self.workers.or(file.workers),
        })
    }
}

/// Everything `natrelay client` needs after merging flags and file
#[derive(Debug)]
pub struct ClientSettings {
    pub server_host: String,
    pub server_port: u16,
    pub tls: bool,
    pub ca_cert: Option<PathBuf>,
    pub tls_server_name: Option<String>,
    pub encrypt: bool,
    pub compress: bool,
    pub retry: RetryPolicy,
    pub backoff: Duration,
    pub workers: Option<usize>,
    pub tunnels: Vec<TunnelRequest>,
}

impl ClientArgs {
    pub fn resolve(self) -> Result<ClientSettings> {
        let file: ClientFile = config::load_or_default(self.config.as_deref())?;

        let Some(server_host) = self.server_host.or(file.server_host) else {
            bail!("No relay host given (--server-host or server_host in the config file)");
        };
        let auth_token = self.auth_token.or(file.auth_token);

        let tunnels = match self.local_port {
            Some(local_port) => {
                let spec = TunnelSpec {
                    tunnel_type: self.tunnel_type,
                    name: self.name,
                    local_addr: self.local_addr,
                    local_port,
                    remote_port: self.remote_port,
                    vhost: self.vhost,
                    auth_token: None,
                    basic_auth: self
                        .basic_auth
                        .as_deref()
                        .map(parse_basic_auth)
                        .transpose()?,
                    set_headers: self.set_headers.into_iter().collect(),
                    add_headers: self.add_headers.into_iter().collect(),
                };
                vec![spec.to_request(auth_token.as_deref())?]
            }
            None => file
                .tunnels
                .iter()
                .map(|spec| spec.to_request(auth_token.as_deref()))
                .collect::<Result<Vec<_>>>()?,
        };
        if tunnels.is_empty() {
            bail!("No tunnels configured (--local-port or tunnels in the config file)");
        }

        let retry = RetryPolicy::from_flags(
            self.retry_on_loss.or(file.retry_on_loss).unwrap_or(true),
            self.retry_on_error.or(file.retry_on_error).unwrap_or(true),
        );

        Ok(ClientSettings {
            server_host,
            server_port: self.server_port.or(file.server_port).unwrap_or(4443),
            tls: self.tls || file.tls.unwrap_or(false),
            ca_cert: self.ca_cert.or(file.ca_cert),
            tls_server_name: self.tls_server_name.or(file.tls_server_name),
            encrypt: self.encrypt || file.encrypt.unwrap_or(false),
            compress: self.compress || file.compress.unwrap_or(false),
            retry,
            backoff: Duration::from_secs(self.backoff_seconds.or(file.backoff_seconds).unwrap_or(3)),
            workers: self.workers.or(file.workers),
            tunnels,
        })
    }
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Invalid {} '{}'", what, addr))
}

fn parse_basic_auth(arg: &str) -> Result<BasicAuthSpec> {
    match arg.split_once(':') {
        Some((username, password)) if !username.is_empty() => Ok(BasicAuthSpec {
            realm: config::default_realm(),
            username: username.to_string(),
            password: password.to_string(),
        }),
        _ => bail!("Basic auth must be USER:PASSWORD"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Commands {
        Cli::try_parse_from(args).unwrap().command
    }

    #[test]
    fn test_server_defaults() {
        let Commands::Server(args) = parse(&["natrelay", "server"]) else {
            panic!("expected server");
        };
        let settings = args.resolve().unwrap();
        assert_eq!(settings.server.control_addr.port(), 4443);
        assert_eq!(settings.server.port_range, PortRange::default());
        assert!(settings.server.http_addr.is_none());
        assert!(settings.tls_cert.is_none());
    }

    #[test]
    fn test_server_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "control_addr": "127.0.0.1:7000", "http_addr": "127.0.0.1:8080", "port_range": "9000-9001" }}"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let Commands::Server(args) = parse(&[
            "natrelay",
            "server",
            "--config",
            path,
            "--control-addr",
            "127.0.0.1:7100",
        ]) else {
            panic!("expected server");
        };
        let settings = args.resolve().unwrap();
        assert_eq!(settings.server.control_addr.port(), 7100);
        assert_eq!(settings.server.http_addr.unwrap().port(), 8080);
        assert!(settings.server.port_range.contains(9001));
        assert!(!settings.server.port_range.contains(9002));
    }

    #[test]
    fn test_server_rejects_bad_port_range_and_lone_cert() {
        let Commands::Server(args) = parse(&["natrelay", "server", "--port-range", "70000"]) else {
            panic!("expected server");
        };
        assert!(args.resolve().is_err());

        let Commands::Server(args) =
            parse(&["natrelay", "server", "--tls-cert", "/tmp/cert.pem"])
        else {
            panic!("expected server");
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn test_client_tunnel_from_flags() {
        let Commands::Client(args) = parse(&[
            "natrelay",
            "client",
            "--server-host",
            "relay.example.com",
            "--type",
            "http",
            "--local-port",
            "3000",
            "--vhost",
            "app.example.com",
            "--basic-auth",
            "admin:secret",
            "--set-header",
            "X-Real-IP=$remote_addr",
            "--retry-on-loss",
            "false",
        ]) else {
            panic!("expected client");
        };
        let settings = args.resolve().unwrap();
        assert_eq!(settings.server_port, 4443);
        assert_eq!(settings.retry, RetryPolicy::ON_ERROR);
        assert_eq!(settings.tunnels.len(), 1);

        let request = &settings.tunnels[0];
        assert_eq!(request.tunnel_type, TunnelType::Http);
        assert_eq!(request.vhost.as_deref(), Some("app.example.com"));
        assert_eq!(request.basic_auth.as_ref().unwrap().username, "admin");
        assert_eq!(request.set_headers.len(), 1);
    }

    #[test]
    fn test_client_requires_tunnels_and_host() {
        let Commands::Client(args) = parse(&["natrelay", "client", "--local-port", "22"]) else {
            panic!("expected client");
        };
        assert!(args.resolve().is_err());

        let Commands::Client(args) =
            parse(&["natrelay", "client", "--server-host", "relay.example.com"])
        else {
            panic!("expected client");
        };
        assert!(args.resolve().is_err());
    }
}
