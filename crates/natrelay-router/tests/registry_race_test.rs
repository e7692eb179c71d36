//! Concurrent registration against the TCP and HTTP registries

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use natrelay_proto::{ChannelConfig, ControlChannel, FrameCodec, PayloadCodec, TunnelRequest};
use natrelay_router::{
    next_tunnel_id, HttpRegistry, PeerAcceptor, RegistryError, SessionChannels, TcpRegistry,
    TunnelFd,
};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

#[derive(Default)]
struct CountingAcceptor {
    accepted: AtomicUsize,
}

impl PeerAcceptor for CountingAcceptor {
    fn accept(&self, _fd: Arc<TunnelFd>, _stream: TcpStream, _peer_addr: SocketAddr) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }
}

fn sessions(request: TunnelRequest) -> Arc<SessionChannels> {
    let (near, _far) = tokio::io::duplex(1024);
    let (control, _inbound) = ControlChannel::spawn(
        Framed::new(near, FrameCodec::new()),
        PayloadCodec::plain(),
        ChannelConfig::default(),
    );
    Arc::new(SessionChannels::new(next_tunnel_id(), request, control))
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_owner_per_port_under_contention() {
    let acceptor = Arc::new(CountingAcceptor::default());
    let registry = Arc::new(TcpRegistry::with_bind_addr(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        acceptor.clone(),
    ));
    let port = free_port();

    let attempts: Vec<_> = (0..8)
        .map(|i| {
            let registry = registry.clone();
            let sessions = sessions(TunnelRequest::tcp("127.0.0.1", 9000 + i, port));
            tokio::spawn(async move { registry.register(port, sessions) })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => winners += 1,
            Err(RegistryError::AlreadyInUse(key)) => assert_eq!(key, port.to_string()),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(registry.len(), 1);

    let _peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    for _ in 0..100 {
        if acceptor.accepted.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 1);

    let fd = registry.unregister(port).await.unwrap();
    assert!(fd.is_closed());
    assert!(registry.is_port_bindable(port));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_owner_per_vhost_under_contention() {
    let registry = Arc::new(HttpRegistry::http());

    let attempts: Vec<_> = (0..8)
        .map(|i| {
            let registry = registry.clone();
            // Case and port differences still name the same vhost
            let host = if i % 2 == 0 {
                "Shop.Example.com"
            } else {
                "shop.example.com:80"
            };
            let sessions = sessions(TunnelRequest::http("127.0.0.1", 3000 + i, host));
            tokio::spawn(async move { registry.register(host, sessions) })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(registry.contains("SHOP.example.com"));

    let fd = registry.lookup("shop.example.com").unwrap();
    // A stale owner id does not remove the live registration
    assert!(registry
        .unregister_tunnel("shop.example.com", fd.tunnel_id() + 1000)
        .is_none());
    assert!(registry
        .unregister_tunnel("shop.example.com", fd.tunnel_id())
        .is_some());
    assert!(registry.is_empty());
}
