//! Transport contract consumed from the signaling layer.
//!
//! PeerLink does not own the network. It runs over any message-oriented
//! duplex link that can deliver structured records (`ciborium::Value`) with
//! `data`, `error` and `close` events, such as a WebRTC data channel. A
//! backend plugs in by implementing [`FrameSink`] for the outbound half,
//! feeding [`LinkEvent`]s into the inbound half, and offering
//! connect/accept through [`Signaling`].

use crate::channel::PacketData;
use crate::error::{ProtocolError, Result};
use crate::wire;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Structured message carried by the transport.
pub type Message = ciborium::Value;

/// Inbound transport event.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A message arrived
    Data(Message),
    /// The transport reported an error
    Error(String),
    /// The link closed
    Close,
}

/// Outbound half of a link.
///
/// # Examples
///
/// ```no_run
/// use peerlink_core::transport::{FrameSink, Message};
///
/// # async fn example(sink: &dyn FrameSink) -> peerlink_core::Result<()> {
/// sink.send(Message::Text("hello".into())).await?;
/// sink.close().await;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Queue a message for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Closed`] once the link is closed.
    async fn send(&self, message: Message) -> Result<()>;

    /// Close the link. Idempotent.
    async fn close(&self);

    /// Whether the link has been closed by either side.
    fn is_closed(&self) -> bool;
}

/// Connect-by-id and accept, provided by the signaling layer.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Identifier other peers use to reach this endpoint.
    fn local_id(&self) -> &str;

    /// Open a link to `peer_id`.
    async fn connect(&self, peer_id: &str) -> Result<Connection>;

    /// Wait for the next inbound link.
    async fn accept(&self) -> Result<Connection>;
}

/// Frame counters for one link.
#[derive(Debug, Default)]
pub struct LinkStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    duplicates_dropped: AtomicU64,
}

impl LinkStats {
    /// Frames handed to the sink.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames delivered to the protocol, duplicates excluded.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Back-to-back duplicate frames dropped.
    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable sending half of a [`Connection`].
#[derive(Clone)]
pub struct LinkSender {
    sink: Arc<dyn FrameSink>,
    stats: Arc<LinkStats>,
}

impl LinkSender {
    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Closed`] if the link is closed.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sink.send(message).await?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close the link.
    pub async fn close(&self) {
        self.sink.close().await;
    }

    /// Whether the link is closed.
    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}

/// Receiving half of a [`Connection`].
///
/// A frame identical to the one delivered immediately before it is a
/// transport duplicate and is dropped. Protocol messages never repeat
/// back-to-back: handshake stages differ and every encrypted frame carries
/// a fresh IV.
pub struct LinkReceiver {
    events: mpsc::UnboundedReceiver<LinkEvent>,
    last: Option<Message>,
    stats: Arc<LinkStats>,
    closed: bool,
}

impl LinkReceiver {
    /// Next event after duplicate suppression; `None` once the link is gone.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        if self.closed {
            return None;
        }
        loop {
            match self.events.recv().await {
                Some(LinkEvent::Data(message)) => {
                    if self.last.as_ref() == Some(&message) {
                        self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Dropping duplicate frame");
                        continue;
                    }
                    self.last = Some(message.clone());
                    self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    return Some(LinkEvent::Data(message));
                }
                Some(LinkEvent::Error(e)) => return Some(LinkEvent::Error(e)),
                Some(LinkEvent::Close) | None => {
                    self.closed = true;
                    return Some(LinkEvent::Close);
                }
            }
        }
    }

    /// Next message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Closed`] on close and
    /// [`ProtocolError::Transport`] on a transport error event.
    pub async fn recv(&mut self) -> Result<Message> {
        match self.next_event().await {
            Some(LinkEvent::Data(message)) => Ok(message),
            Some(LinkEvent::Error(e)) => Err(ProtocolError::Transport(e.into())),
            Some(LinkEvent::Close) | None => Err(ProtocolError::Closed),
        }
    }

    /// Next message, racing a timer.
    ///
    /// Expiry abandons the wait only; the link itself is left for the caller
    /// to tear down.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ResponseTimeout`] naming `stage` on expiry.
    pub async fn recv_timeout(&mut self, timeout: Duration, stage: &'static str) -> Result<Message> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ProtocolError::timeout(stage))?
    }
}

/// One duplex link to a peer named by the signaling layer.
pub struct Connection {
    peer_id: String,
    sender: LinkSender,
    receiver: LinkReceiver,
    stats: Arc<LinkStats>,
}

impl Connection {
    /// Assemble a connection from a backend's halves.
    pub fn new(
        peer_id: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        let stats = Arc::new(LinkStats::default());
        Self {
            peer_id: peer_id.into(),
            sender: LinkSender {
                sink,
                stats: stats.clone(),
            },
            receiver: LinkReceiver {
                events,
                last: None,
                stats: stats.clone(),
                closed: false,
            },
            stats,
        }
    }

    /// Peer id as reported by the signaling layer. Untrusted until negotiated.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Frame counters.
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Closed`] if the link is closed.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message).await
    }

    /// Send a packet as `{d: packet}` without encryption.
    ///
    /// Only for control traffic before negotiation completes. Once a
    /// connection is handed to a `SecureChannel` this method is out of reach.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Closed`] if the link is closed.
    pub async fn send_unsecure(&self, packet: &PacketData) -> Result<()> {
        self.sender.send(wire::unsecure_frame(packet.to_value()?)).await
    }

    /// Next message.
    ///
    /// # Errors
    ///
    /// See [`LinkReceiver::recv`].
    pub async fn recv(&mut self) -> Result<Message> {
        self.receiver.recv().await
    }

    /// Next message within `timeout`.
    ///
    /// # Errors
    ///
    /// See [`LinkReceiver::recv_timeout`].
    pub async fn recv_timeout(&mut self, timeout: Duration, stage: &'static str) -> Result<Message> {
        self.receiver.recv_timeout(timeout, stage).await
    }

    /// Close the link.
    pub async fn close(&self) {
        self.sender.close().await;
    }

    /// Whether the link is closed.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Split into peer id, sending half and receiving half.
    pub fn into_parts(self) -> (String, LinkSender, LinkReceiver) {
        (self.peer_id, self.sender, self.receiver)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.peer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
