//! Byte relay between a session's socket and the control channel

use std::sync::Arc;

use bytes::Bytes;
use natrelay_proto::{ProtoMessage, SessionHead};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::fd::TrafficStats;
use crate::session::{PeerCommand, PeerReceiver, SessionChannels};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Which end of the tunnel this socket lives on.
///
/// Decides the disconnect message sent when the socket reaches EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    /// Server side: a public peer connection
    Remote,
    /// Client side: a connection to the local service
    Local,
}

impl RelaySide {
    fn disconnect(&self, head: SessionHead) -> ProtoMessage {
        match self {
            RelaySide::Remote => ProtoMessage::remote_disconnect(head),
            RelaySide::Local => ProtoMessage::local_disconnect(head),
        }
    }
}

/// Pump bytes between `stream` and the tunnel until either side finishes.
///
/// Reads become TRANSFER frames for `session_id`; commands queued on the
/// session's [`crate::PeerHandle`] become writes. When the socket reaches EOF
/// the session is removed and the disconnect frame is sent, but only by
/// whoever actually removed it.
pub async fn relay<S>(
    stream: S,
    session_id: u64,
    receiver: PeerReceiver,
    sessions: Arc<SessionChannels>,
    side: RelaySide,
    stats: Option<Arc<TrafficStats>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let head = sessions.head(session_id);
    let (mut reader, mut writer) = tokio::io::split(stream);
    let PeerReceiver {
        mut commands,
        cancel,
    } = receiver;

    let read_side = {
        let sessions = sessions.clone();
        let stats = stats.clone();
        let cancel = cancel.clone();
        async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = reader.read(&mut buf) => match result {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            debug!("Session {}:{} read error: {}", head.tunnel_id, session_id, e);
                            break;
                        }
                    },
                };

                trace!("Session {}:{} read {} bytes", head.tunnel_id, session_id, n);
                if let Some(stats) = &stats {
                    stats.add_inbound(n);
                }

                let msg = ProtoMessage::transfer(head, Bytes::copy_from_slice(&buf[..n]));
                if sessions.control().send(msg).is_err() {
                    cancel.cancel();
                    return;
                }
            }

            if sessions.remove(session_id).is_some() {
                let _ = sessions.control().send(side.disconnect(head));
            }
        }
    };

    let write_side = {
        let cancel = cancel.clone();
        async move {
            loop {
                let cmd = tokio::select! {
                    _ = cancel.cancelled() => return,
                    cmd = commands.recv() => cmd,
                };

                match cmd {
                    Some(PeerCommand::Data(data)) => {
                        if let Err(e) = writer.write_all(&data).await {
                            debug!("Session {}:{} write error: {}", head.tunnel_id, session_id, e);
                            break;
                        }
                        if let Some(stats) = &stats {
                            stats.add_outbound(data.len());
                        }
                    }
                    Some(PeerCommand::Close) | None => {
                        let _ = writer.shutdown().await;
                        cancel.cancel();
                        return;
                    }
                }
            }

            // Peer can no longer receive; end the session from this side
            if sessions.remove(session_id).is_some() {
                let _ = sessions.control().send(side.disconnect(head));
            }
            cancel.cancel();
        }
    };

    tokio::join!(read_side, write_side);
    trace!("Session {}:{} relay finished", head.tunnel_id, session_id);
}
