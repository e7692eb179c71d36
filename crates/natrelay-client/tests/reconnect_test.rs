//! Supervisor behavior against a scripted server
//!
//! The server side speaks the wire protocol by hand so each test decides
//! exactly how a registered connection ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use natrelay_client::{
    build_tls_connector, ClientConfig, RetryPolicy, TunnelDescriptor, TunnelObserver, TunnelState,
};
use natrelay_proto::{FrameCodec, MessageType, PayloadCodec, ProtoMessage, TunnelRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const TUNNEL_ID: u64 = 7;

#[derive(Debug, Clone, Copy)]
enum Ending {
    /// Close the socket after registering
    Eof,
    /// Send a frame whose payload envelope cannot be opened
    Garbage,
    /// Force the tunnel off and wait for the acknowledgement
    ForceOff,
    /// Keep the connection open
    Hold,
    /// Never answer the request
    Silent,
    /// Close the first connection after registering, hold every later one
    EofOnce,
}

struct ScriptedServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    force_off_acked: Arc<AtomicBool>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn sealed(msg: ProtoMessage) -> ProtoMessage {
    let data = PayloadCodec::plain().seal(msg.data.clone()).unwrap();
    ProtoMessage { data, ..msg }
}

async fn scripted_server(ending: Ending) -> ScriptedServer {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = ScriptedServer {
        addr: listener.local_addr().unwrap(),
        accepted: Arc::new(AtomicUsize::new(0)),
        force_off_acked: Arc::new(AtomicBool::new(false)),
    };

    let accepted = server.accepted.clone();
    let acked = server.force_off_acked.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let ending = match (ending, accepted.fetch_add(1, Ordering::SeqCst)) {
                (Ending::EofOnce, 0) => Ending::Eof,
                (Ending::EofOnce, _) => Ending::Hold,
                (ending, _) => ending,
            };
            tokio::spawn(serve_one(stream, ending, acked.clone()));
        }
    });

    server
}

async fn serve_one(stream: TcpStream, ending: Ending, acked: Arc<AtomicBool>) {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let request = loop {
        match framed.next().await {
            Some(Ok(msg)) if msg.kind == MessageType::Request => break msg,
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    if matches!(ending, Ending::Silent) {
        while framed.next().await.is_some() {}
        return;
    }

    let data = PayloadCodec::plain().open(request.data).unwrap();
    framed
        .send(sealed(ProtoMessage::response_ok(TUNNEL_ID, data)))
        .await
        .unwrap();

    match ending {
        Ending::Eof => {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ending::Garbage => {
            let garbage = ProtoMessage {
                data: Bytes::from_static(&[0xff, 0x01, 0x02]),
                ..ProtoMessage::pong()
            };
            let _ = framed.send(garbage).await;
            while framed.next().await.is_some() {}
        }
        Ending::ForceOff => {
            framed
                .send(sealed(ProtoMessage::force_off(TUNNEL_ID)))
                .await
                .unwrap();
            while let Some(Ok(msg)) = framed.next().await {
                if msg.kind == MessageType::ForceOffReply {
                    acked.store(true, Ordering::SeqCst);
                }
            }
        }
        Ending::Hold | Ending::Silent | Ending::EofOnce => {
            while framed.next().await.is_some() {}
        }
    }
}

#[derive(Default)]
struct Recorder {
    connecting: AtomicUsize,
    connected: AtomicUsize,
    disconnects: Mutex<Vec<bool>>,
}

impl TunnelObserver for Recorder {
    fn on_connecting(&self, _reconnect: bool) {
        self.connecting.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connected(&self, request: &TunnelRequest) {
        assert_eq!(request.local_port, 8080);
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self, error: bool, _cause: &str) {
        self.disconnects.lock().unwrap().push(error);
    }
}

fn descriptor(
    server: &ScriptedServer,
    retry: RetryPolicy,
) -> (TunnelDescriptor, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let config = ClientConfig::new("127.0.0.1", server.addr.port())
        .with_retry(retry)
        .with_backoff(Duration::from_millis(50));
    let descriptor = TunnelDescriptor::with_observer(
        config,
        TunnelRequest::tcp("127.0.0.1", 8080, 0),
        recorder.clone(),
    );
    (descriptor, recorder)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..150 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

async fn join(descriptor: &TunnelDescriptor) {
    timeout(Duration::from_secs(5), descriptor.join())
        .await
        .expect("supervisor did not finish");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_loss_reconnects_with_loss_policy() {
    let server = scripted_server(Ending::EofOnce).await;
    let (descriptor, recorder) = descriptor(&server, RetryPolicy::ON_LOSS);

    descriptor.start();
    let r = recorder.clone();
    eventually(|| r.connected.load(Ordering::SeqCst) == 2).await;
    // Nothing beyond the single reconnect
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.connecting.load(Ordering::SeqCst), 2);
    assert_eq!(descriptor.state(), TunnelState::Connected);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![false]);

    descriptor.shutdown();
    join(&descriptor).await;

    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![false, false]);
    assert_eq!(descriptor.tunnel_id(), Some(TUNNEL_ID));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_loss_final_without_loss_policy() {
    let server = scripted_server(Ending::Eof).await;
    let (descriptor, recorder) = descriptor(&server, RetryPolicy::ON_ERROR);

    descriptor.start();
    join(&descriptor).await;

    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![false]);
    assert_eq!(descriptor.state(), TunnelState::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_error_not_retried_with_loss_policy() {
    let server = scripted_server(Ending::Garbage).await;
    let (descriptor, recorder) = descriptor(&server, RetryPolicy::ON_LOSS);

    descriptor.start();
    join(&descriptor).await;

    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![true]);
    assert!(descriptor.last_error().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_force_off_is_final() {
    let server = scripted_server(Ending::ForceOff).await;
    let (descriptor, recorder) = descriptor(&server, RetryPolicy::ALWAYS);

    descriptor.start();
    join(&descriptor).await;

    let acked = server.force_off_acked.clone();
    eventually(|| acked.load(Ordering::SeqCst)).await;
    // Give a wrongly scheduled reconnect the chance to show up
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![false]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_while_connected() {
    let server = scripted_server(Ending::Hold).await;
    let (descriptor, recorder) = descriptor(&server, RetryPolicy::ALWAYS);

    descriptor.start();
    let d = descriptor.clone();
    eventually(|| d.state() == TunnelState::Connected).await;
    assert_eq!(
        descriptor.confirmed_request().map(|r| r.local_port),
        Some(8080)
    );

    descriptor.shutdown();
    join(&descriptor).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(descriptor.state(), TunnelState::Shutdown);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![false]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_connected_after_shutdown_during_connect() {
    let server = scripted_server(Ending::Silent).await;
    let (descriptor, recorder) = descriptor(&server, RetryPolicy::ALWAYS);

    descriptor.start();
    let accepted = server.accepted.clone();
    eventually(|| accepted.load(Ordering::SeqCst) == 1).await;
    assert_eq!(descriptor.state(), TunnelState::Connecting);

    descriptor.shutdown();
    join(&descriptor).await;

    assert_eq!(recorder.connected.load(Ordering::SeqCst), 0);
    assert_eq!(descriptor.state(), TunnelState::Shutdown);
    assert_eq!(recorder.connecting.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![false]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_tls_handshake_is_retried() {
    init_tracing();
    // Accepts TCP and never answers the ClientHello
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    let mut config = ClientConfig::new("127.0.0.1", addr.port())
        .with_tls(build_tls_connector(None).unwrap())
        .with_tls_server_name("localhost")
        .with_retry(RetryPolicy::ALWAYS)
        .with_backoff(Duration::from_millis(50));
    config.connect_timeout = Duration::from_millis(300);
    let recorder = Arc::new(Recorder::default());
    let descriptor = TunnelDescriptor::with_observer(
        config,
        TunnelRequest::tcp("127.0.0.1", 8080, 0),
        recorder.clone(),
    );

    descriptor.start();
    let count = accepted.clone();
    eventually(|| count.load(Ordering::SeqCst) >= 2).await;
    descriptor.shutdown();
    join(&descriptor).await;

    assert_eq!(recorder.connected.load(Ordering::SeqCst), 0);
    let disconnects = recorder.disconnects.lock().unwrap();
    assert!(disconnects[0]);
    assert!(descriptor
        .last_error()
        .is_some_and(|e| e.contains("TLS") && e.contains("timed out")));
}
