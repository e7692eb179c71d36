//! Reconnection supervisor
//!
//! A [`TunnelDescriptor`] owns one logical tunnel for its whole lifetime and
//! reconnects it according to the configured [`crate::RetryPolicy`]:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED -> ...
//!                                   (any state) -> SHUTDOWN
//! ```

use std::sync::{Arc, Mutex};

use natrelay_proto::{CloseCause, TunnelRequest};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::handler::{self, SessionEnd};

/// Callbacks for tunnel state transitions. All methods default to no-ops.
pub trait TunnelObserver: Send + Sync {
    /// A connect attempt starts; `reconnect` is false only for the first one
    fn on_connecting(&self, _reconnect: bool) {}

    /// The server accepted the tunnel
    fn on_connected(&self, _request: &TunnelRequest) {}

    /// The tunnel went down. `error` separates failures from orderly closes.
    fn on_disconnect(&self, _error: bool, _cause: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Shutdown,
}

#[derive(Debug)]
struct Status {
    state: TunnelState,
    shut_down: bool,
    started: bool,
    tunnel_id: Option<u64>,
    confirmed: Option<TunnelRequest>,
    last_error: Option<String>,
}

struct Inner {
    config: ClientConfig,
    request: TunnelRequest,
    observer: Option<Arc<dyn TunnelObserver>>,
    status: Mutex<Status>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one supervised tunnel
#[derive(Clone)]
pub struct TunnelDescriptor {
    inner: Arc<Inner>,
}

impl TunnelDescriptor {
    pub fn new(config: ClientConfig, request: TunnelRequest) -> Self {
        Self::build(config, request, None)
    }

    pub fn with_observer(
        config: ClientConfig,
        request: TunnelRequest,
        observer: Arc<dyn TunnelObserver>,
    ) -> Self {
        Self::build(config, request, Some(observer))
    }

    fn build(
        config: ClientConfig,
        request: TunnelRequest,
        observer: Option<Arc<dyn TunnelObserver>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                request,
                observer,
                status: Mutex::new(Status {
                    state: TunnelState::Disconnected,
                    shut_down: false,
                    started: false,
                    tunnel_id: None,
                    confirmed: None,
                    last_error: None,
                }),
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Spawn the supervisor task. Calling it again, or after shutdown, does nothing.
    pub fn start(&self) {
        {
            let Ok(mut status) = self.inner.status.lock() else {
                return;
            };
            if status.started || status.shut_down {
                return;
            }
            status.started = true;
        }

        let handle = tokio::spawn(supervise(self.inner.clone()));
        if let Ok(mut task) = self.inner.task.lock() {
            *task = Some(handle);
        }
    }

    /// Stop for good: cancel any pending backoff or connect and abort the
    /// live connection. No CONNECTED transition can follow.
    pub fn shutdown(&self) {
        if let Ok(mut status) = self.inner.status.lock() {
            status.shut_down = true;
            status.state = TunnelState::Shutdown;
        }
        self.inner.shutdown.cancel();
    }

    /// Wait for the supervisor task to finish
    pub async fn join(&self) {
        let handle = self.inner.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn request(&self) -> &TunnelRequest {
        &self.inner.request
    }

    pub fn state(&self) -> TunnelState {
        self.with_status(|s| s.state)
            .unwrap_or(TunnelState::Shutdown)
    }

    pub fn is_shut_down(&self) -> bool {
        self.with_status(|s| s.shut_down).unwrap_or(true)
    }

    /// Tunnel id of the current or last connection
    pub fn tunnel_id(&self) -> Option<u64> {
        self.with_status(|s| s.tunnel_id).flatten()
    }

    /// Request as last confirmed by the server
    pub fn confirmed_request(&self) -> Option<TunnelRequest> {
        self.with_status(|s| s.confirmed.clone()).flatten()
    }

    pub fn last_error(&self) -> Option<String> {
        self.with_status(|s| s.last_error.clone()).flatten()
    }

    fn with_status<T>(&self, f: impl FnOnce(&Status) -> T) -> Option<T> {
        self.inner.status.lock().ok().map(|s| f(&s))
    }
}

impl Inner {
    /// Move to `state` unless shut down
    fn transition(&self, state: TunnelState) -> bool {
        let Ok(mut status) = self.status.lock() else {
            return false;
        };
        if status.shut_down {
            return false;
        }
        status.state = state;
        true
    }

    fn disconnected(&self, error: bool, cause: &str) {
        if let Ok(mut status) = self.status.lock() {
            if !status.shut_down {
                status.state = TunnelState::Disconnected;
            }
            if error {
                status.last_error = Some(cause.to_string());
            }
        }
        if let Some(observer) = &self.observer {
            observer.on_disconnect(error, cause);
        }
    }
}

const SHUT_DOWN: &str = "shut down";

async fn supervise(inner: Arc<Inner>) {
    let policy = inner.config.retry;
    let mut reconnect = false;

    loop {
        if !inner.transition(TunnelState::Connecting) {
            break;
        }
        if let Some(observer) = &inner.observer {
            observer.on_connecting(reconnect);
        }
        info!(
            "{} {} via {}",
            if reconnect { "Reconnecting" } else { "Connecting" },
            inner.request.local_endpoint(),
            inner.config.server_addr()
        );

        let attempt = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => {
                inner.disconnected(false, SHUT_DOWN);
                break;
            }
            attempt = handler::connect(&inner.config, &inner.request) => attempt,
        };

        let tunnel = match attempt {
            Ok(tunnel) => tunnel,
            Err(e) if e.is_rejection() => {
                inner.disconnected(true, &e.to_string());
                warn!("{}; not retrying", e);
                break;
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                inner.disconnected(true, &e.to_string());
                if !policy.retries_on_error() || !backoff(&inner).await {
                    break;
                }
                reconnect = true;
                continue;
            }
        };

        // Publish CONNECTED under the same lock shutdown() takes
        let published = match inner.status.lock() {
            Ok(mut status) if !status.shut_down => {
                status.state = TunnelState::Connected;
                status.tunnel_id = Some(tunnel.tunnel_id());
                status.confirmed = Some(tunnel.request().clone());
                true
            }
            _ => false,
        };
        if !published {
            tunnel.abort();
            inner.disconnected(false, SHUT_DOWN);
            break;
        }
        if let Some(observer) = &inner.observer {
            observer.on_connected(tunnel.request());
        }

        let (error, cause) = match tunnel.run(inner.shutdown.clone()).await {
            SessionEnd::Shutdown => {
                inner.disconnected(false, SHUT_DOWN);
                break;
            }
            SessionEnd::ForceOff => {
                inner.disconnected(false, "forced off by server");
                break;
            }
            SessionEnd::Closed(CloseCause::Clean) => (false, "connection closed".to_string()),
            SessionEnd::Closed(CloseCause::Error(reason)) => (true, reason),
        };

        info!("Tunnel disconnected: {}", cause);
        inner.disconnected(error, &cause);
        if !policy.should_retry(error) || !backoff(&inner).await {
            break;
        }
        reconnect = true;
    }

    debug!("Supervisor for {} finished", inner.request.local_endpoint());
}

/// Sleep for the backoff; false when shut down meanwhile
async fn backoff(inner: &Inner) -> bool {
    debug!("Retrying in {:?}", inner.config.backoff);
    tokio::select! {
        _ = inner.shutdown.cancelled() => false,
        _ = tokio::time::sleep(inner.config.backoff) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        connecting: AtomicUsize,
        disconnects: Mutex<Vec<(bool, String)>>,
    }

    impl TunnelObserver for Counting {
        fn on_connecting(&self, _reconnect: bool) {
            self.connecting.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, error: bool, cause: &str) {
            self.disconnects.lock().unwrap().push((error, cause.to_string()));
        }
    }

    fn unreachable_config() -> ClientConfig {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        ClientConfig::new("127.0.0.1", port).with_backoff(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_connect_failure_without_error_retry_finalizes() {
        let observer = Arc::new(Counting::default());
        let descriptor = TunnelDescriptor::with_observer(
            unreachable_config().with_retry(RetryPolicy::ON_LOSS),
            TunnelRequest::tcp("127.0.0.1", 8000, 0),
            observer.clone(),
        );

        descriptor.start();
        tokio::time::timeout(Duration::from_secs(5), descriptor.join())
            .await
            .unwrap();

        assert_eq!(observer.connecting.load(Ordering::SeqCst), 1);
        let disconnects = observer.disconnects.lock().unwrap();
        assert_eq!(disconnects.len(), 1);
        assert!(disconnects[0].0);
        assert_eq!(descriptor.state(), TunnelState::Disconnected);
        assert!(descriptor.last_error().is_some());
    }

    #[tokio::test]
    async fn test_connect_failure_retried_on_error() {
        let observer = Arc::new(Counting::default());
        let descriptor = TunnelDescriptor::with_observer(
            unreachable_config().with_retry(RetryPolicy::ON_ERROR),
            TunnelRequest::tcp("127.0.0.1", 8000, 0),
            observer.clone(),
        );

        descriptor.start();
        for _ in 0..100 {
            if observer.connecting.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        descriptor.shutdown();
        tokio::time::timeout(Duration::from_secs(5), descriptor.join())
            .await
            .unwrap();

        assert!(observer.connecting.load(Ordering::SeqCst) >= 3);
        assert_eq!(descriptor.state(), TunnelState::Shutdown);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_noop() {
        let observer = Arc::new(Counting::default());
        let descriptor = TunnelDescriptor::with_observer(
            unreachable_config(),
            TunnelRequest::tcp("127.0.0.1", 8000, 0),
            observer.clone(),
        );

        descriptor.shutdown();
        descriptor.start();
        descriptor.join().await;

        assert_eq!(observer.connecting.load(Ordering::SeqCst), 0);
        assert!(descriptor.is_shut_down());
    }
}
