//! JSON configuration files
//!
//! Both subcommands accept `--config <file.json>`. Every field is optional;
//! values given on the command line win over the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use natrelay_proto::{BasicAuth, TunnelRequest, TunnelType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// `natrelay server --config`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerFile {
    pub control_addr: Option<String>,
    pub tls_control_addr: Option<String>,
    pub http_addr: Option<String>,
    pub https_addr: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Allowed TCP ports, e.g. `"1024-65535"` or `"8000, 9000-9100"`
    pub port_range: Option<String>,
    pub tunnel_bind_addr: Option<String>,
    pub auth_token: Option<String>,
    pub require_encryption: Option<bool>,
    pub workers: Option<usize>,
    pub idle_seconds: Option<u64>,
    pub watchdog_seconds: Option<u64>,
}

/// `natrelay client --config`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientFile {
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub tls: Option<bool>,
    pub ca_cert: Option<PathBuf>,
    pub tls_server_name: Option<String>,
    pub encrypt: Option<bool>,
    pub compress: Option<bool>,
    pub retry_on_loss: Option<bool>,
    pub retry_on_error: Option<bool>,
    pub backoff_seconds: Option<u64>,
    /// Default for tunnels that do not carry their own token
    pub auth_token: Option<String>,
    pub workers: Option<usize>,
    pub tunnels: Vec<TunnelSpec>,
}

/// One tunnel in a client config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[serde(rename = "type", default = "default_tunnel_type")]
    pub tunnel_type: TunnelType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub vhost: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuthSpec>,
    #[serde(default)]
    pub set_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub add_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuthSpec {
    #[serde(default = "default_realm")]
    pub realm: String,
    pub username: String,
    pub password: String,
}

fn default_tunnel_type() -> TunnelType {
    TunnelType::Tcp
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

pub fn default_realm() -> String {
    "natrelay".to_string()
}

impl TunnelSpec {
    /// Build the wire request, falling back to `default_token`
    pub fn to_request(&self, default_token: Option<&str>) -> Result<TunnelRequest> {
        let mut request = match self.tunnel_type {
            TunnelType::Tcp => {
                TunnelRequest::tcp(self.local_addr.clone(), self.local_port, self.remote_port)
            }
            TunnelType::Http | TunnelType::Https => {
                let Some(vhost) = self.vhost.as_deref().filter(|v| !v.is_empty()) else {
                    bail!(
                        "{} tunnel to port {} needs a vhost",
                        self.tunnel_type,
                        self.local_port
                    );
                };
                if self.tunnel_type == TunnelType::Http {
                    TunnelRequest::http(self.local_addr.clone(), self.local_port, vhost)
                } else {
                    TunnelRequest::https(self.local_addr.clone(), self.local_port, vhost)
                }
            }
        };

        if let Some(name) = &self.name {
            request = request.with_name(name.clone());
        }
        if let Some(token) = self.auth_token.as_deref().or(default_token) {
            request = request.with_auth_token(token);
        }
        if let Some(auth) = &self.basic_auth {
            request = request.with_basic_auth(BasicAuth::new(
                auth.realm.clone(),
                auth.username.clone(),
                auth.password.clone(),
            ));
        }
        for (name, value) in &self.set_headers {
            request = request.with_set_header(name.clone(), value.clone());
        }
        for (name, value) in &self.add_headers {
            request = request.with_add_header(name.clone(), value.clone());
        }
        Ok(request)
    }
}

pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Load `path` if given, else an empty config
pub fn load_or_default<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(path) => load(path),
        None => Ok(T::default()),
    }
}

/// Parse a `name=value` header argument
pub fn parse_header(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", arg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_client_file_with_tunnels() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "server_host": "relay.example.com",
                "server_port": 4443,
                "encrypt": true,
                "auth_token": "shared",
                "tunnels": [
                    {{ "local_port": 5432, "remote_port": 15432 }},
                    {{
                        "type": "http",
                        "local_port": 3000,
                        "vhost": "app.example.com",
                        "basic_auth": {{ "username": "admin", "password": "pw" }},
                        "set_headers": {{ "X-Real-IP": "$remote_addr" }}
                    }}
                ]
            }}"#
        )
        .unwrap();

        let config: ClientFile = load(file.path()).unwrap();
        assert_eq!(config.server_host.as_deref(), Some("relay.example.com"));
        assert_eq!(config.encrypt, Some(true));
        assert_eq!(config.tunnels.len(), 2);

        let tcp = config.tunnels[0].to_request(Some("shared")).unwrap();
        assert_eq!(tcp.tunnel_type, TunnelType::Tcp);
        assert_eq!(tcp.local_addr, "127.0.0.1");
        assert_eq!(tcp.remote_port, 15432);
        assert_eq!(tcp.auth_token.as_deref(), Some("shared"));

        let http = config.tunnels[1].to_request(None).unwrap();
        assert_eq!(http.vhost.as_deref(), Some("app.example.com"));
        assert_eq!(http.basic_auth.as_ref().unwrap().realm, "natrelay");
        assert_eq!(
            http.set_headers,
            vec![("X-Real-IP".to_string(), "$remote_addr".to_string())]
        );
    }

    #[test]
    fn test_load_server_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "control_addr": "0.0.0.0:7000", "port_range": "20000-20100", "workers": 4 }}"#
        )
        .unwrap();

        let config: ServerFile = load(file.path()).unwrap();
        assert_eq!(config.control_addr.as_deref(), Some("0.0.0.0:7000"));
        assert_eq!(config.port_range.as_deref(), Some("20000-20100"));
        assert_eq!(config.workers, Some(4));
        assert!(config.http_addr.is_none());
    }

    #[test]
    fn test_invalid_json_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = load::<ServerFile>(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_http_tunnel_without_vhost_rejected() {
        let spec: TunnelSpec =
            serde_json::from_str(r#"{ "type": "https", "local_port": 443 }"#).unwrap();
        assert!(spec.to_request(None).is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Forwarded-For=$remote_addr").unwrap(),
            ("X-Forwarded-For".to_string(), "$remote_addr".to_string())
        );
        assert!(parse_header("missing-separator").is_err());
        assert!(parse_header("=value").is_err());
    }
}
