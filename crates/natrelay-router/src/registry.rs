//! Generic tunnel registry
//!
//! Maps a routing key (TCP port or HTTP vhost) to the single live
//! [`TunnelFd`] that owns it.

use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::fd::{TunnelFd, TunnelSnapshot};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} is already in use")]
    AlreadyInUse(String),

    #[error("Failed to bind port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Registry is shut down")]
    Closed,
}

pub struct TunnelRegistry<K> {
    tunnels: DashMap<K, Arc<TunnelFd>>,
    closed: AtomicBool,
}

impl<K> TunnelRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Atomically claim `key`.
    ///
    /// `make` runs while the key's shard is locked, so it must not touch this
    /// registry; it is only called when the key is free.
    pub fn register_with<F>(&self, key: K, make: F) -> Result<Arc<TunnelFd>, RegistryError>
    where
        F: FnOnce() -> Result<TunnelFd, RegistryError>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }

        let fd = match self.tunnels.entry(key.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyInUse(key.to_string())),
            Entry::Vacant(entry) => {
                let fd = Arc::new(make()?);
                entry.insert(fd.clone());
                fd
            }
        };

        // Lost a race with shutdown()
        if self.closed.load(Ordering::SeqCst) {
            self.unregister_tunnel(&key, fd.tunnel_id());
            fd.close();
            return Err(RegistryError::Closed);
        }

        debug!("Registered tunnel {} on {}", fd.tunnel_id(), key);
        Ok(fd)
    }

    /// Remove whatever owns `key` and close it
    pub fn unregister(&self, key: &K) -> Option<Arc<TunnelFd>> {
        let (_, fd) = self.tunnels.remove(key)?;
        fd.close();
        debug!("Unregistered tunnel {} from {}", fd.tunnel_id(), key);
        Some(fd)
    }

    /// Remove `key` only while it is still owned by `tunnel_id`.
    ///
    /// Used on control channel close so a stale owner can never evict a
    /// newer registration of the same key.
    pub fn unregister_tunnel(&self, key: &K, tunnel_id: u64) -> Option<Arc<TunnelFd>> {
        let (_, fd) = self
            .tunnels
            .remove_if(key, |_, fd| fd.tunnel_id() == tunnel_id)?;
        fd.close();
        debug!("Unregistered tunnel {} from {}", tunnel_id, key);
        Some(fd)
    }

    pub fn lookup(&self, key: &K) -> Option<Arc<TunnelFd>> {
        trace!("Looking up tunnel for {}", key);
        self.tunnels.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.tunnels.contains_key(key)
    }

    /// Send FORCE_OFF to the owner of `key`; it stays registered until its
    /// control channel closes
    pub fn force_off(&self, key: &K) -> bool {
        match self.lookup(key) {
            Some(fd) => fd.force_off(),
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let mut rows: Vec<TunnelSnapshot> =
            self.tunnels.iter().map(|e| e.value().snapshot()).collect();
        rows.sort_by_key(|row| row.tunnel_id);
        rows
    }

    pub fn keys(&self) -> Vec<K> {
        self.tunnels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Refuse new registrations and close every tunnel
    pub fn shutdown(&self) -> Vec<Arc<TunnelFd>> {
        self.closed.store(true, Ordering::SeqCst);
        let closed: Vec<_> = self
            .keys()
            .iter()
            .filter_map(|key| self.unregister(key))
            .collect();
        debug!("Registry shut down, closed {} tunnels", closed.len());
        closed
    }
}

impl<K> Default for TunnelRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}
