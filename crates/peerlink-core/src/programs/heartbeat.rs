//! Liveness heartbeat.
//!
//! Sends `{type:"heartbeat", content:{data:<random u32>}}` every interval
//! and closes the channel when nothing has arrived from the peer for longer
//! than the timeout. The random payload keeps consecutive heartbeats from
//! looking like transport duplicates.

use super::{ContactProgram, ProgramContext};
use crate::channel::PacketData;
use crate::config::HeartbeatConfig;
use crate::error::Result;
use crate::transport::Message;
use async_trait::async_trait;
use ciborium::value::Integer;
use peerlink_crypto::random::random_u32;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Packet type used by heartbeats.
pub const HEARTBEAT: &str = "heartbeat";

fn heartbeat_packet() -> Result<PacketData> {
    Ok(PacketData::new(
        HEARTBEAT,
        Message::Map(vec![(
            Message::Text("data".into()),
            Message::Integer(Integer::from(random_u32()?)),
        )]),
    ))
}

/// Periodic heartbeat with a silence timeout.
pub struct HeartbeatProgram {
    config: HeartbeatConfig,
    last_seen: Arc<Mutex<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatProgram {
    /// Create a heartbeat program.
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_seen: Arc::new(Mutex::new(Instant::now())),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ContactProgram for HeartbeatProgram {
    fn name(&self) -> &'static str {
        HEARTBEAT
    }

    async fn on_connected(&self, ctx: &ProgramContext) -> Result<()> {
        *self.last_seen.lock().await = Instant::now();

        let ctx = ctx.clone();
        let last_seen = self.last_seen.clone();
        let HeartbeatConfig { interval, timeout } = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let silent_for = last_seen.lock().await.elapsed();
                if silent_for > timeout {
                    tracing::warn!(peer = %ctx.peer().id(), ?silent_for, "Heartbeat timeout, closing channel");
                    ctx.sender().close().await;
                    break;
                }
                let sent = match heartbeat_packet() {
                    Ok(packet) => ctx.send(&packet).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::debug!(peer = %ctx.peer().id(), "Heartbeat stopped: {}", e);
                    break;
                }
            }
        });

        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn on_data(&self, _ctx: &ProgramContext, packet: &PacketData) -> Result<()> {
        if packet.kind == HEARTBEAT {
            *self.last_seen.lock().await = Instant::now();
        }
        Ok(())
    }

    async fn on_disconnected(&self, _ctx: &ProgramContext) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}
