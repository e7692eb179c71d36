//! Control channel I/O pump
//!
//! A control connection is driven by two tasks: a reader that decodes frames,
//! opens their payload envelope and hands them to the owner, and a writer that
//! drains an unbounded outbound queue. Handlers only ever see the cloneable
//! [`ControlChannel`] handle and the inbound receiver.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::FrameCodec;
use crate::messages::{MessageType, ProtoMessage};
use crate::payload::PayloadCodec;

/// Any byte stream a control connection can run over (plain TCP, TLS, in-memory duplex)
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ControlStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

#[derive(Debug, Error)]
#[error("Control channel closed")]
pub struct ChannelClosed;

/// Liveness settings
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Send PING when nothing was written for this long
    pub ping_interval: Duration,
    /// Treat the peer as dead when nothing was read for this long
    pub read_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Why a control channel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Orderly close by either side
    Clean,
    /// Transport or protocol failure
    Error(String),
}

impl CloseCause {
    pub fn is_error(&self) -> bool {
        matches!(self, CloseCause::Error(_))
    }
}

enum Outbound {
    Message(ProtoMessage),
    Close,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    cause: Mutex<Option<CloseCause>>,
}

impl Shared {
    /// First recorded cause wins
    fn record(&self, cause: CloseCause) {
        if let Ok(mut slot) = self.cause.lock() {
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
    }
}

/// Handle to a running control connection
#[derive(Clone)]
pub struct ControlChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ControlChannel {
    /// Start the reader and writer tasks over an already-framed stream.
    ///
    /// Inbound messages arrive on the returned receiver with their payload
    /// envelope already opened. The receiver yields `None` once the channel
    /// has closed, at which point [`ControlChannel::cause`] is set.
    pub fn spawn<S: ControlStream>(
        framed: Framed<S, FrameCodec>,
        payload: PayloadCodec,
        config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProtoMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            cause: Mutex::new(None),
        });

        let (sink, stream) = framed.split();

        tokio::spawn(write_loop(
            sink,
            outbound_rx,
            payload.clone(),
            config.ping_interval,
            shared.clone(),
        ));
        tokio::spawn(read_loop(
            stream,
            inbound_tx,
            payload,
            config.read_timeout,
            shared.clone(),
        ));

        (Self { shared }, inbound_rx)
    }

    /// Queue a message. Payload hardening is applied by the writer.
    pub fn send(&self, msg: ProtoMessage) -> Result<(), ChannelClosed> {
        if self.shared.cancel.is_cancelled() {
            return Err(ChannelClosed);
        }
        self.shared
            .outbound
            .send(Outbound::Message(msg))
            .map_err(|_| ChannelClosed)
    }

    /// Graceful close: everything queued so far is written first
    pub fn close(&self) {
        self.shared.record(CloseCause::Clean);
        if self.shared.outbound.send(Outbound::Close).is_err() {
            self.shared.cancel.cancel();
        }
    }

    /// Immediate close, dropping anything still queued
    pub fn abort(&self) {
        self.shared.record(CloseCause::Clean);
        self.shared.cancel.cancel();
    }

    /// Immediate close recording a transport/protocol failure
    pub fn fail(&self, reason: impl Into<String>) {
        self.shared.record(CloseCause::Error(reason.into()));
        self.shared.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once both I/O tasks have been told to stop
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    pub fn cause(&self) -> Option<CloseCause> {
        self.shared.cause.lock().ok().and_then(|c| c.clone())
    }

    /// Identity comparison between handles
    pub fn same_channel(&self, other: &ControlChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

async fn write_loop<S: ControlStream>(
    mut sink: futures::stream::SplitSink<Framed<S, FrameCodec>, ProtoMessage>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    payload: PayloadCodec,
    ping_interval: Duration,
    shared: Arc<Shared>,
) {
    let idle = tokio::time::sleep(ping_interval);
    tokio::pin!(idle);

    loop {
        let msg = tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,

            cmd = outbound.recv() => match cmd {
                Some(Outbound::Message(msg)) => msg,
                Some(Outbound::Close) | None => {
                    if let Err(e) = sink.close().await {
                        debug!("Error closing control stream: {}", e);
                    }
                    shared.cancel.cancel();
                    break;
                }
            },

            _ = &mut idle => {
                trace!("Write idle, sending ping");
                ProtoMessage::ping()
            }
        };

        let msg = if msg.kind == MessageType::Handshake {
            msg
        } else {
            match payload.seal(msg.data.clone()) {
                Ok(data) => ProtoMessage { data, ..msg },
                Err(e) => {
                    warn!("Failed to seal {:?} payload: {}", msg.kind, e);
                    shared.record(CloseCause::Error(e.to_string()));
                    shared.cancel.cancel();
                    break;
                }
            }
        };

        trace!("Writing {:?} ({} bytes)", msg.kind, msg.data.len());
        if let Err(e) = sink.send(msg).await {
            debug!("Control stream write failed: {}", e);
            shared.record(CloseCause::Error(e.to_string()));
            shared.cancel.cancel();
            break;
        }

        idle.as_mut().reset(Instant::now() + ping_interval);
    }
}

async fn read_loop<S: ControlStream>(
    mut stream: futures::stream::SplitStream<Framed<S, FrameCodec>>,
    inbound: mpsc::UnboundedSender<ProtoMessage>,
    payload: PayloadCodec,
    read_timeout: Duration,
    shared: Arc<Shared>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };

        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!("Control stream read failed: {}", e);
                shared.record(CloseCause::Error(e.to_string()));
                shared.cancel.cancel();
                break;
            }
            Ok(None) => {
                debug!("Control stream reached EOF");
                shared.record(CloseCause::Clean);
                shared.cancel.cancel();
                break;
            }
            Err(_) => {
                warn!("No traffic for {:?}, treating peer as dead", read_timeout);
                shared.record(CloseCause::Error("read timeout".to_string()));
                shared.cancel.cancel();
                break;
            }
        };

        let msg = if msg.kind == MessageType::Handshake {
            msg
        } else {
            match payload.open(msg.data.clone()) {
                Ok(data) => ProtoMessage { data, ..msg },
                Err(e) => {
                    warn!("Failed to open {:?} payload: {}", msg.kind, e);
                    shared.record(CloseCause::Error(e.to_string()));
                    shared.cancel.cancel();
                    break;
                }
            }
        };

        trace!("Read {:?} ({} bytes)", msg.kind, msg.data.len());
        if inbound.send(msg).is_err() {
            // Owner is gone
            shared.record(CloseCause::Clean);
            shared.cancel.cancel();
            break;
        }
    }
}
