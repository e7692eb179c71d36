//! HTTP virtual host registry
//!
//! No sockets are bound per tunnel; the shared HTTP(S) listener resolves the
//! owning tunnel from each request's `Host` header.

use std::sync::Arc;

use tracing::info;

use crate::fd::{TunnelFd, TunnelSnapshot};
use crate::registry::{RegistryError, TunnelRegistry};
use crate::session::SessionChannels;

pub struct HttpRegistry {
    tunnels: TunnelRegistry<String>,
    is_https: bool,
}

impl HttpRegistry {
    pub fn http() -> Self {
        Self {
            tunnels: TunnelRegistry::new(),
            is_https: false,
        }
    }

    pub fn https() -> Self {
        Self {
            tunnels: TunnelRegistry::new(),
            is_https: true,
        }
    }

    pub fn is_https(&self) -> bool {
        self.is_https
    }

    pub fn register(
        &self,
        vhost: &str,
        sessions: Arc<SessionChannels>,
    ) -> Result<Arc<TunnelFd>, RegistryError> {
        let key = normalize_host(vhost);
        let is_https = self.is_https;
        let fd = self
            .tunnels
            .register_with(key.clone(), || Ok(TunnelFd::new(key.clone(), is_https, sessions)))?;

        info!(
            "{} tunnel {} serving vhost {}",
            if is_https { "HTTPS" } else { "HTTP" },
            fd.tunnel_id(),
            key
        );
        Ok(fd)
    }

    pub fn unregister(&self, vhost: &str) -> Option<Arc<TunnelFd>> {
        self.tunnels.unregister(&normalize_host(vhost))
    }

    pub fn unregister_tunnel(&self, vhost: &str, tunnel_id: u64) -> Option<Arc<TunnelFd>> {
        self.tunnels
            .unregister_tunnel(&normalize_host(vhost), tunnel_id)
    }

    /// Resolve a raw `Host` header value
    pub fn lookup(&self, host: &str) -> Option<Arc<TunnelFd>> {
        self.tunnels.lookup(&normalize_host(host))
    }

    pub fn contains(&self, host: &str) -> bool {
        self.tunnels.contains(&normalize_host(host))
    }

    pub fn force_off(&self, vhost: &str) -> bool {
        self.tunnels.force_off(&normalize_host(vhost))
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

    pub fn shutdown(&self) {
        self.tunnels.shutdown();
    }
}

/// Lowercase, port stripped (`"A.Example.com:8080"` -> `"a.example.com"`)
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal
        match rest.split_once(']') {
            Some((addr, _)) => addr,
            None => rest,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Find the `Host` header in a parsed header list
pub fn extract_host(headers: &[(String, String)]) -> Option<&str> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.as_str())
}
