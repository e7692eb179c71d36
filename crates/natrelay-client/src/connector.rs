//! Connections to the local service, one per session

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use natrelay_proto::ProtoMessage;
use natrelay_router::{relay, PeerHandle, RelaySide, SessionChannels};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Dials `local_addr:local_port` for each session the server opens.
///
/// The session is registered before the dial completes; payloads sent to it
/// meanwhile queue up in order and are written once the connection is up.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    target: String,
    dial_timeout: Duration,
}

impl LocalConnector {
    pub fn new(target: impl Into<String>, dial_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            dial_timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forward `data` to the session, opening it first if needed
    pub fn deliver(&self, sessions: &Arc<SessionChannels>, session_id: u64, data: Bytes) {
        let peer = match sessions.get(session_id) {
            Some(peer) => peer,
            None => match self.open(sessions, session_id) {
                Some(peer) => peer,
                None => return,
            },
        };
        if !peer.send(data) {
            debug!("Session {} already closed", session_id);
        }
    }

    /// Register the session and start dialing. Returns `None` when the
    /// session exists already or the tunnel is closing.
    pub fn open(&self, sessions: &Arc<SessionChannels>, session_id: u64) -> Option<PeerHandle> {
        let (handle, receiver) = PeerHandle::new(self.target.clone());
        if let Err(e) = sessions.put_with_id(session_id, handle.clone()) {
            debug!("Not opening session {}: {}", session_id, e);
            return None;
        }

        let sessions = sessions.clone();
        let target = self.target.clone();
        let dial_timeout = self.dial_timeout;
        tokio::spawn(async move {
            let head = sessions.head(session_id);
            let dialed = tokio::time::timeout(dial_timeout, TcpStream::connect(&target)).await;

            let stream = match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("Failed to reach local service {}: {}", target, e);
                    abandon(&sessions, session_id);
                    return;
                }
                Err(_) => {
                    warn!("Timed out reaching local service {}", target);
                    abandon(&sessions, session_id);
                    return;
                }
            };
            let _ = stream.set_nodelay(true);

            if sessions
                .control()
                .send(ProtoMessage::local_connected(head))
                .is_err()
            {
                return;
            }
            debug!("Session {}:{} connected to {}", head.tunnel_id, session_id, target);
            relay(stream, session_id, receiver, sessions, RelaySide::Local, None).await;
        });

        Some(handle)
    }
}

fn abandon(sessions: &SessionChannels, session_id: u64) {
    if let Some(peer) = sessions.remove(session_id) {
        peer.force_close();
        let _ = sessions
            .control()
            .send(ProtoMessage::local_disconnect(sessions.head(session_id)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natrelay_proto::{
        ChannelConfig, ControlChannel, FrameCodec, MessageType, PayloadCodec, TunnelRequest,
    };
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::codec::Framed;

    type Channel = (ControlChannel, mpsc::UnboundedReceiver<ProtoMessage>);

    fn channel_pair() -> (Channel, Channel) {
        let (a, b) = duplex(64 * 1024);
        (
            ControlChannel::spawn(
                Framed::new(a, FrameCodec::new()),
                PayloadCodec::plain(),
                ChannelConfig::default(),
            ),
            ControlChannel::spawn(
                Framed::new(b, FrameCodec::new()),
                PayloadCodec::plain(),
                ChannelConfig::default(),
            ),
        )
    }

    #[tokio::test]
    async fn test_buffered_payloads_arrive_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ((control, _near_rx), (_far, mut far_rx)) = channel_pair();
        let sessions = Arc::new(SessionChannels::new(
            3,
            TunnelRequest::tcp("127.0.0.1", port, 0),
            control,
        ));
        let connector = LocalConnector::new(format!("127.0.0.1:{}", port), Duration::from_secs(5));

        // Queued before the local service has even accepted
        connector.deliver(&sessions, 1, Bytes::from_static(b"one "));
        connector.deliver(&sessions, 1, Bytes::from_static(b"two "));
        connector.deliver(&sessions, 1, Bytes::from_static(b"three"));
        assert_eq!(sessions.len(), 1);

        let (mut local, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 13];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one two three");

        let connected = far_rx.recv().await.unwrap();
        assert_eq!(connected.kind, MessageType::LocalConnected);
        assert_eq!(connected.session_head().unwrap().session_id, 1);

        local.write_all(b"reply").await.unwrap();
        drop(local);

        let transfer = far_rx.recv().await.unwrap();
        assert_eq!(transfer.kind, MessageType::Transfer);
        assert_eq!(&transfer.data[..], b"reply");

        let disconnect = far_rx.recv().await.unwrap();
        assert_eq!(disconnect.kind, MessageType::LocalDisconnect);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_sends_local_disconnect() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let ((control, _near_rx), (_far, mut far_rx)) = channel_pair();
        let sessions = Arc::new(SessionChannels::new(
            4,
            TunnelRequest::tcp("127.0.0.1", port, 0),
            control,
        ));
        let connector = LocalConnector::new(format!("127.0.0.1:{}", port), Duration::from_secs(5));

        connector.deliver(&sessions, 9, Bytes::from_static(b"lost"));

        let disconnect = far_rx.recv().await.unwrap();
        assert_eq!(disconnect.kind, MessageType::LocalDisconnect);
        assert_eq!(disconnect.session_head().unwrap().session_id, 9);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_open_existing_session_is_noop() {
        let ((control, _near_rx), _far) = channel_pair();
        let sessions = Arc::new(SessionChannels::new(
            5,
            TunnelRequest::tcp("127.0.0.1", 1, 0),
            control,
        ));
        let (peer, _receiver) = PeerHandle::new("existing");
        sessions.put_with_id(2, peer).unwrap();

        let connector = LocalConnector::new("127.0.0.1:1", Duration::from_secs(1));
        assert!(connector.open(&sessions, 2).is_none());
        assert_eq!(sessions.len(), 1);
    }
}
