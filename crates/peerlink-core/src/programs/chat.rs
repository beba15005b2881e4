//! Plain text chat over `{type:"message", content:<text>}` packets.

use super::{ContactProgram, ProgramContext};
use crate::channel::{ChannelSender, PacketData};
use crate::error::{ProtocolError, Result};
use crate::transport::Message;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::watch;

/// Packet type used by chat messages.
pub const MESSAGE: &str = "message";

fn is_blank(text: &str) -> bool {
    text.chars().all(char::is_whitespace)
}

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the peer
    Inbound,
    /// Sent to the peer
    Outbound,
}

/// One chat line.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Address id of the other side of the conversation
    pub peer: String,
    /// Message text
    pub text: String,
    /// Direction
    pub direction: Direction,
    /// Local receive or send time
    pub at: SystemTime,
}

/// Shared, observable message log.
#[derive(Debug, Clone)]
pub struct ChatLog {
    messages: Arc<Mutex<Vec<ChatMessage>>>,
    count: Arc<watch::Sender<usize>>,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatLog {
    /// Empty log.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            count: Arc::new(count),
        }
    }

    fn push(&self, peer: &str, text: &str, direction: Direction) {
        let len = {
            let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
            messages.push(ChatMessage {
                peer: peer.to_string(),
                text: text.to_string(),
                direction,
                at: SystemTime::now(),
            });
            messages.len()
        };
        self.count.send_replace(len);
    }

    /// Snapshot of all messages in arrival order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the log holds at least `n` messages.
    pub async fn wait_for_len(&self, n: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|len| *len >= n).await;
    }
}

/// Send a chat message and record it.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidState`] for blank text and the channel's
/// error if sending fails.
pub async fn send_message(sender: &ChannelSender, log: &ChatLog, text: &str) -> Result<()> {
    if is_blank(text) {
        return Err(ProtocolError::invalid_state("refusing to send a blank message"));
    }
    sender
        .send(&PacketData::new(MESSAGE, Message::Text(text.to_string())))
        .await?;
    log.push(sender.peer_id(), text, Direction::Outbound);
    Ok(())
}

/// Records inbound chat messages into a [`ChatLog`].
pub struct ChatProgram {
    log: ChatLog,
}

impl ChatProgram {
    /// Create a chat program writing to `log`.
    pub fn new(log: ChatLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ContactProgram for ChatProgram {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn on_data(&self, ctx: &ProgramContext, packet: &PacketData) -> Result<()> {
        if packet.kind != MESSAGE {
            return Ok(());
        }
        let text = packet
            .content
            .as_text()
            .ok_or(ProtocolError::malformed("chat message content is not text"))?;
        if is_blank(text) {
            return Ok(());
        }
        tracing::debug!(peer = %ctx.peer().id(), "Chat message received");
        self.log.push(ctx.peer().id(), text, Direction::Inbound);
        Ok(())
    }
}
