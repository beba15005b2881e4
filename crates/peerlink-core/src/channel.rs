//! Authenticated, encrypted steady-state channel.
//!
//! A [`SecureChannel`] wraps a negotiated connection and its session key.
//! Every application packet is CBOR-encoded, sealed under AES-256-GCM with a
//! fresh 96-bit IV and sent as `{i, d}`.
//!
//! Inbound frames flow through an ordered pipeline:
//!
//! ```text
//! LinkReceiver --> intake --(spawn decrypt)--> [handles] --> delivery --> ChannelStream
//!                    |                                          |
//!                    `-- unsecure / malformed frames            `-- counts consecutive
//!                        queued as errors in arrival order          decrypt failures
//! ```
//!
//! Errors never drop silently: each bad frame becomes a
//! [`ChannelEvent::Error`] in its arrival slot. After
//! `max_decrypt_failures` consecutive decryption failures the link is closed.

use crate::config::ChannelConfig;
use crate::error::{ProtocolError, Result};
use crate::pipeline::{self, PipelineStats};
use crate::transport::{Connection, LinkEvent, LinkReceiver, LinkSender, Message};
use crate::wire::{self, Frame};
use peerlink_crypto::{EncryptedPacket, SessionKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Application payload: a type tag plus arbitrary structured content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketData {
    /// Packet type, e.g. `"message"` or `"heartbeat"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload
    pub content: Message,
}

impl PacketData {
    /// Create a packet.
    pub fn new(kind: impl Into<String>, content: Message) -> Self {
        Self {
            kind: kind.into(),
            content,
        }
    }

    /// Structured form, used for unsecure control frames.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if the packet cannot be represented.
    pub fn to_value(&self) -> Result<Message> {
        Message::serialized(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse the structured form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedMessage`] if `value` is not `{type, content}`.
    pub fn from_value(value: &Message) -> Result<Self> {
        value
            .deserialized()
            .map_err(|_| ProtocolError::malformed("packet is not {type, content}"))
    }

    /// Compact binary form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Parse the binary form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedMessage`] if `bytes` do not decode.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|_| ProtocolError::malformed("packet does not decode"))
    }
}

pub(crate) fn encode_value(value: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode_value(bytes: &[u8]) -> Result<Message> {
    ciborium::from_reader(bytes).map_err(|_| ProtocolError::malformed("payload does not decode"))
}

fn seal_packet(key: &SessionKey, packet: &PacketData) -> Result<EncryptedPacket> {
    Ok(key.seal(&packet.encode()?)?)
}

fn open_packet(key: &SessionKey, envelope: &EncryptedPacket) -> Result<PacketData> {
    PacketData::decode(&key.open(envelope)?)
}

/// Event delivered by a [`ChannelStream`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A packet decrypted and decoded
    Data(PacketData),
    /// A frame failed, or the transport reported an error
    Error(ProtocolError),
    /// The link closed; no further events follow
    Closed,
}

/// Cloneable sending half of a secure channel.
#[derive(Clone)]
pub struct ChannelSender {
    peer_id: Arc<str>,
    link: LinkSender,
    key: Arc<SessionKey>,
}

impl ChannelSender {
    /// Encrypt and send a packet.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Closed`] if the link is closed.
    pub async fn send(&self, packet: &PacketData) -> Result<()> {
        let envelope = seal_packet(&self.key, packet)?;
        self.link.send(wire::secure_frame(&envelope)).await
    }

    /// Close the underlying link.
    pub async fn close(&self) {
        self.link.close().await;
    }

    /// Whether the link is closed.
    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// Id of the authenticated peer.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("peer_id", &self.peer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Secure channel over an authenticated connection.
pub struct SecureChannel {
    sender: ChannelSender,
    receiver: LinkReceiver,
    config: ChannelConfig,
}

impl SecureChannel {
    /// Wrap a negotiated connection.
    pub fn new(conn: Connection, session_key: SessionKey, config: ChannelConfig) -> Self {
        let (peer_id, link, receiver) = conn.into_parts();
        Self {
            sender: ChannelSender {
                peer_id: peer_id.into(),
                link,
                key: Arc::new(session_key),
            },
            receiver,
            config,
        }
    }

    /// Id of the authenticated peer.
    pub fn peer_id(&self) -> &str {
        self.sender.peer_id()
    }

    /// The session key.
    pub fn session_key(&self) -> &SessionKey {
        &self.sender.key
    }

    /// Encode and seal a packet under a fresh IV.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or encryption fails.
    pub fn encrypt(&self, packet: &PacketData) -> Result<EncryptedPacket> {
        seal_packet(&self.sender.key, packet)
    }

    /// Open and decode an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decryption`] on authentication failure and
    /// [`ProtocolError::MalformedMessage`] if the plaintext does not decode.
    pub fn decrypt(&self, envelope: &EncryptedPacket) -> Result<PacketData> {
        open_packet(&self.sender.key, envelope)
    }

    /// Encrypt and send a packet.
    ///
    /// # Errors
    ///
    /// See [`ChannelSender::send`].
    pub async fn send(&self, packet: &PacketData) -> Result<()> {
        self.sender.send(packet).await
    }

    /// A cloneable sending half.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Start the inbound pipeline.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn into_stream(self) -> (ChannelSender, ChannelStream) {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);
        let (submitter, drain) = pipeline::ordered(self.config.pipeline_depth);
        let stats = submitter.stats().clone();
        let sender = self.sender.clone();

        let pump = tokio::spawn(pump(
            self.receiver,
            submitter,
            drain,
            events_tx,
            self.sender,
            self.config.max_decrypt_failures,
        ));

        (
            sender,
            ChannelStream {
                events: events_rx,
                pump,
                stats,
                finished: false,
            },
        )
    }
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer_id", &self.peer_id())
            .field("session", self.session_key())
            .finish()
    }
}

async fn pump(
    mut receiver: LinkReceiver,
    submitter: pipeline::PipelineSubmitter<PacketData>,
    mut drain: pipeline::PipelineDrain<PacketData>,
    events: mpsc::Sender<ChannelEvent>,
    sender: ChannelSender,
    max_decrypt_failures: u32,
) {
    let key = sender.key.clone();

    let intake = async move {
        while let Some(event) = receiver.next_event().await {
            let queued = match event {
                LinkEvent::Data(message) => match wire::parse_frame(&message) {
                    Ok(Frame::Secure(envelope)) => {
                        let key = key.clone();
                        submitter
                            .submit(async move { open_packet(&key, &envelope) })
                            .await
                    }
                    Ok(Frame::Unsecure(_)) => {
                        submitter
                            .submit(async {
                                Err(ProtocolError::malformed(
                                    "unsecure frame after authentication",
                                ))
                            })
                            .await
                    }
                    Err(e) => submitter.submit(async move { Err(e) }).await,
                },
                LinkEvent::Error(e) => {
                    submitter
                        .submit(async move { Err(ProtocolError::Transport(e.into())) })
                        .await
                }
                LinkEvent::Close => break,
            };
            if queued.is_err() {
                break;
            }
        }
        // Dropping the submitter lets the drain finish what is queued.
    };

    let delivery = async {
        let mut failures = 0u32;
        while let Some(result) = drain.next().await {
            let event = match result {
                Ok(packet) => {
                    failures = 0;
                    ChannelEvent::Data(packet)
                }
                Err(e) => {
                    if matches!(e, ProtocolError::Decryption(_)) {
                        failures += 1;
                        tracing::warn!(peer = %sender.peer_id(), failures, "Frame failed to decrypt: {}", e);
                        if failures >= max_decrypt_failures && !sender.is_closed() {
                            tracing::warn!(peer = %sender.peer_id(), "Closing channel after repeated decryption failures");
                            sender.close().await;
                        }
                    } else {
                        tracing::debug!(peer = %sender.peer_id(), "Channel error: {}", e);
                    }
                    ChannelEvent::Error(e)
                }
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
        let _ = events.send(ChannelEvent::Closed).await;
    };

    tokio::join!(intake, delivery);
}

/// Ordered inbound events of a secure channel.
pub struct ChannelStream {
    events: mpsc::Receiver<ChannelEvent>,
    pump: JoinHandle<()>,
    stats: Arc<PipelineStats>,
    finished: bool,
}

impl ChannelStream {
    /// Next event in arrival order; `None` after [`ChannelEvent::Closed`].
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(ChannelEvent::Closed) | None => {
                self.finished = true;
                Some(ChannelEvent::Closed)
            }
            Some(event) => Some(event),
        }
    }

    /// Frames submitted and not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight()
    }

    /// Frames submitted and still decrypting.
    pub fn decrypting(&self) -> usize {
        self.stats.decrypting()
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
