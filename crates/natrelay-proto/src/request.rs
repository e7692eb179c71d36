//! Tunnel request model

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Header value placeholder replaced by the remote peer address at proxy time
pub const REMOTE_ADDR_TOKEN: &str = "$remote_addr";

/// Kind of public endpoint a tunnel exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Tcp,
    Http,
    Https,
}

impl TunnelType {
    pub fn is_http(&self) -> bool {
        matches!(self, TunnelType::Http | TunnelType::Https)
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::Tcp => write!(f, "tcp"),
            TunnelType::Http => write!(f, "http"),
            TunnelType::Https => write!(f, "https"),
        }
    }
}

impl std::str::FromStr for TunnelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TunnelType::Tcp),
            "http" => Ok(TunnelType::Http),
            "https" => Ok(TunnelType::Https),
            other => Err(format!("unknown tunnel type: {}", other)),
        }
    }
}

/// HTTP basic-auth challenge settings for a vhost tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub enabled: bool,
    pub realm: String,
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(realm: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            enabled: true,
            realm: realm.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Description of a tunnel as requested by a client.
///
/// The server may answer with a derived copy (for instance with
/// `remote_port` assigned); the original is never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub tunnel_type: TunnelType,
    /// Display name, free-form
    pub name: Option<String>,
    pub local_addr: String,
    pub local_port: u16,
    /// TCP only; 0 asks the server to pick one
    pub remote_port: u16,
    /// HTTP/HTTPS only
    pub vhost: Option<String>,
    pub auth_token: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    /// Headers replacing any existing value, in declaration order
    pub set_headers: Vec<(String, String)>,
    /// Headers appended alongside existing values, in declaration order
    pub add_headers: Vec<(String, String)>,
    pub extras: BTreeMap<String, String>,
}

impl TunnelRequest {
    pub fn tcp(local_addr: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self::new(TunnelType::Tcp, local_addr.into(), local_port, remote_port, None)
    }

    pub fn http(local_addr: impl Into<String>, local_port: u16, vhost: impl Into<String>) -> Self {
        Self::new(TunnelType::Http, local_addr.into(), local_port, 0, Some(vhost.into()))
    }

    pub fn https(local_addr: impl Into<String>, local_port: u16, vhost: impl Into<String>) -> Self {
        Self::new(TunnelType::Https, local_addr.into(), local_port, 0, Some(vhost.into()))
    }

    fn new(
        tunnel_type: TunnelType,
        local_addr: String,
        local_port: u16,
        remote_port: u16,
        vhost: Option<String>,
    ) -> Self {
        Self {
            tunnel_type,
            name: None,
            local_addr,
            local_port,
            remote_port,
            vhost,
            auth_token: None,
            basic_auth: None,
            set_headers: Vec::new(),
            add_headers: Vec::new(),
            extras: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_basic_auth(mut self, basic_auth: BasicAuth) -> Self {
        self.basic_auth = Some(basic_auth);
        self
    }

    pub fn with_set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Copy of this request with the remote port replaced
    pub fn with_remote_port(&self, remote_port: u16) -> Self {
        let mut copy = self.clone();
        copy.remote_port = remote_port;
        copy
    }

    /// Copy of this request with the vhost replaced
    pub fn with_vhost(&self, vhost: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.vhost = Some(vhost.into());
        copy
    }

    /// Human readable public endpoint, e.g. `:20000` or `a.example.com`
    pub fn public_endpoint(&self) -> String {
        match self.tunnel_type {
            TunnelType::Tcp => format!(":{}", self.remote_port),
            TunnelType::Http | TunnelType::Https => self.vhost.clone().unwrap_or_default(),
        }
    }

    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }

    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.tunnel_type,
            self.public_endpoint(),
            self.local_endpoint()
        )
    }
}
