//! Full round trips: public peer -> relay server -> client -> local service

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use natrelay_client::{tls_connector_from_pem, ClientConfig, TunnelDescriptor, TunnelState};
use natrelay_control::{tls_acceptor_from_pem, RelayServer, ServerConfig};
use natrelay_proto::{PortRange, TunnelRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Relay {
    control: SocketAddr,
    tls_control: Option<SocketAddr>,
    http: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn server_config(port_range: PortRange) -> ServerConfig {
    ServerConfig {
        control_addr: "127.0.0.1:0".parse().unwrap(),
        tunnel_bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port_range,
        ..ServerConfig::default()
    }
}

async fn start_relay(config: ServerConfig, tls: Option<tokio_rustls::TlsAcceptor>) -> Relay {
    init_tracing();
    let server = RelayServer::bind(config, tls).await.unwrap();
    let relay = Relay {
        control: server.control_addr().unwrap(),
        tls_control: server.tls_control_addr(),
        http: server.http_addr(),
        shutdown: CancellationToken::new(),
    };
    tokio::spawn(server.run(relay.shutdown.clone()));
    relay
}

/// Local service echoing everything back
async fn echo_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// Local service answering one HTTP request per connection
async fn http_service(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

async fn wait_connected(descriptor: &TunnelDescriptor) {
    for _ in 0..250 {
        if descriptor.state() == TunnelState::Connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "tunnel never connected: {:?}",
        descriptor.last_error()
    );
}

async fn echo_through(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut reader, mut writer) = peer.split();

    let write = async {
        writer.write_all(payload).await.unwrap();
    };
    let read = async {
        let mut received = vec![0u8; payload.len()];
        reader.read_exact(&mut received).await.unwrap();
        received
    };
    let (_, received) = timeout(Duration::from_secs(10), async { tokio::join!(write, read) })
        .await
        .expect("echo timed out");
    received
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_tunnel_round_trip() {
    let public_port = free_port();
    let relay = start_relay(server_config(PortRange::new(public_port, public_port)), None).await;
    let local_port = echo_service().await;

    let descriptor = TunnelDescriptor::new(
        ClientConfig::new("127.0.0.1", relay.control.port()),
        TunnelRequest::tcp("127.0.0.1", local_port, 0),
    );
    descriptor.start();
    wait_connected(&descriptor).await;
    assert_eq!(
        descriptor.confirmed_request().map(|r| r.remote_port),
        Some(public_port)
    );

    let payload: Vec<u8> = (0..=255u8).cycle().take(256 * 1024).collect();
    assert_eq!(echo_through(public_port, &payload).await, payload);

    // Sessions are independent of each other
    let (a, b) = tokio::join!(
        echo_through(public_port, b"first session"),
        echo_through(public_port, b"second session")
    );
    assert_eq!(a, b"first session");
    assert_eq!(b, b"second session");

    descriptor.shutdown();
    timeout(Duration::from_secs(5), descriptor.join()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_encrypted_compressed_http_tunnel() {
    let mut config = server_config(PortRange::default());
    config.http_addr = Some("127.0.0.1:0".parse().unwrap());
    config.require_encryption = true;
    let relay = start_relay(config, None).await;
    let local_port = http_service("hello through the relay").await;

    let descriptor = TunnelDescriptor::new(
        ClientConfig::new("127.0.0.1", relay.control.port())
            .with_encryption(true)
            .with_compression(true),
        TunnelRequest::http("127.0.0.1", local_port, "demo.example.com"),
    );
    descriptor.start();
    wait_connected(&descriptor).await;

    let mut browser = TcpStream::connect(relay.http.unwrap()).await.unwrap();
    browser
        .write_all(b"GET / HTTP/1.1\r\nHost: demo.example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(10), browser.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello through the relay"));

    descriptor.shutdown();
    timeout(Duration::from_secs(5), descriptor.join()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tls_control_connection() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.cert.pem();
    let key_pem = cert.key_pair.serialize_pem();
    let acceptor = tls_acceptor_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();

    let public_port = free_port();
    let mut config = server_config(PortRange::new(public_port, public_port));
    config.tls_control_addr = Some("127.0.0.1:0".parse().unwrap());
    let relay = start_relay(config, Some(acceptor)).await;
    let local_port = echo_service().await;

    let connector = tls_connector_from_pem(cert_pem.as_bytes()).unwrap();
    let descriptor = TunnelDescriptor::new(
        ClientConfig::new("127.0.0.1", relay.tls_control.unwrap().port())
            .with_tls(connector)
            .with_tls_server_name("localhost"),
        TunnelRequest::tcp("127.0.0.1", local_port, public_port),
    );
    descriptor.start();
    wait_connected(&descriptor).await;

    assert_eq!(echo_through(public_port, b"over tls").await, b"over tls");

    descriptor.shutdown();
    timeout(Duration::from_secs(5), descriptor.join()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_shutdown_reconnects_until_stopped() {
    let public_port = free_port();
    let relay = start_relay(server_config(PortRange::new(public_port, public_port)), None).await;
    let local_port = echo_service().await;

    let descriptor = TunnelDescriptor::new(
        ClientConfig::new("127.0.0.1", relay.control.port())
            .with_backoff(Duration::from_millis(50)),
        TunnelRequest::tcp("127.0.0.1", local_port, 0),
    );
    descriptor.start();
    wait_connected(&descriptor).await;

    drop(relay);
    for _ in 0..250 {
        if descriptor.state() != TunnelState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_ne!(descriptor.state(), TunnelState::Connected);

    descriptor.shutdown();
    timeout(Duration::from_secs(5), descriptor.join()).await.unwrap();
    assert_eq!(descriptor.state(), TunnelState::Shutdown);
}
