//! In-memory signaling and links for tests and local simulation.
//!
//! Every link direction runs a forwarder task that holds each frame until
//! `sent_at + latency` and may deliver it twice in a row. Frames in one
//! direction keep their order.

use crate::error::{ProtocolError, Result};
use crate::transport::{Connection, FrameSink, LinkEvent, Message, Signaling};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

/// Simulated link behaviour.
#[derive(Debug, Clone, Default)]
pub struct LinkConditions {
    /// One-way delay applied to every frame
    pub latency: Duration,
    /// Probability in `[0, 1]` that a frame is delivered twice
    pub duplicate_rate: f64,
    /// Seed for the duplication RNG; entropy when `None`
    pub seed: Option<u64>,
}

impl LinkConditions {
    /// Conditions with the given latency and duplication rate.
    #[must_use]
    pub fn new(latency: Duration, duplicate_rate: f64) -> Self {
        Self {
            latency,
            duplicate_rate: duplicate_rate.clamp(0.0, 1.0),
            seed: None,
        }
    }

    /// Fix the duplication RNG seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rng(&self, stream: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        }
    }
}

enum Transit {
    Frame(Message),
    Close,
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<(Instant, Transit)>,
    local: mpsc::UnboundedSender<LinkEvent>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    fn spawn(
        closed: Arc<AtomicBool>,
        local: mpsc::UnboundedSender<LinkEvent>,
        remote: mpsc::UnboundedSender<LinkEvent>,
        conditions: &LinkConditions,
        stream: u64,
    ) -> Self {
        let (outbound, mut queue) = mpsc::unbounded_channel::<(Instant, Transit)>();
        let latency = conditions.latency;
        let duplicate_rate = conditions.duplicate_rate.clamp(0.0, 1.0);
        let mut rng = conditions.rng(stream);

        tokio::spawn(async move {
            while let Some((sent_at, transit)) = queue.recv().await {
                if !latency.is_zero() {
                    tokio::time::sleep_until(sent_at + latency).await;
                }
                match transit {
                    Transit::Frame(message) => {
                        let duplicate = duplicate_rate > 0.0 && rng.gen_bool(duplicate_rate);
                        if duplicate {
                            let _ = remote.send(LinkEvent::Data(message.clone()));
                        }
                        if remote.send(LinkEvent::Data(message)).is_err() {
                            break;
                        }
                    }
                    Transit::Close => {
                        let _ = remote.send(LinkEvent::Close);
                        break;
                    }
                }
            }
        });

        Self {
            outbound,
            local,
            closed,
        }
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        self.outbound
            .send((Instant::now(), Transit::Frame(message)))
            .map_err(|_| ProtocolError::Closed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.local.send(LinkEvent::Close);
            let _ = self.outbound.send((Instant::now(), Transit::Close));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct NetworkInner {
    endpoints: DashMap<String, mpsc::UnboundedSender<Connection>>,
    conditions: LinkConditions,
}

/// Hub joining [`MemorySignaling`] endpoints.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Network with instant, lossless, duplicate-free links.
    #[must_use]
    pub fn new() -> Self {
        Self::with_conditions(LinkConditions::default())
    }

    /// Network whose links follow `conditions`.
    #[must_use]
    pub fn with_conditions(conditions: LinkConditions) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: DashMap::new(),
                conditions,
            }),
        }
    }

    /// Register an endpoint reachable as `id`, replacing any previous one.
    #[must_use]
    pub fn endpoint(&self, id: &str) -> MemorySignaling {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.endpoints.insert(id.to_string(), tx);
        MemorySignaling {
            id: id.to_string(),
            network: self.clone(),
            incoming: Mutex::new(rx),
        }
    }

    /// Build a linked pair directly: the first end talks to `b`, the second to `a`.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn link(&self, a: &str, b: &str) -> (Connection, Connection) {
        let closed = Arc::new(AtomicBool::new(false));
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let conditions = &self.inner.conditions;

        let a_sink = MemorySink::spawn(closed.clone(), a_tx.clone(), b_tx.clone(), conditions, 0);
        let b_sink = MemorySink::spawn(closed, b_tx, a_tx, conditions, 1);

        (
            Connection::new(b, Arc::new(a_sink), a_rx),
            Connection::new(a, Arc::new(b_sink), b_rx),
        )
    }
}

/// Signaling endpoint on a [`MemoryNetwork`].
pub struct MemorySignaling {
    id: String,
    network: MemoryNetwork,
    incoming: Mutex<mpsc::UnboundedReceiver<Connection>>,
}

#[async_trait]
impl Signaling for MemorySignaling {
    fn local_id(&self) -> &str {
        &self.id
    }

    async fn connect(&self, peer_id: &str) -> Result<Connection> {
        let inbox = self
            .network
            .inner
            .endpoints
            .get(peer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProtocolError::Transport(format!("unknown peer {peer_id}").into()))?;

        let (local, remote) = self.network.link(&self.id, peer_id);
        inbox
            .send(remote)
            .map_err(|_| ProtocolError::transport("peer stopped accepting connections"))?;
        tracing::debug!(from = %self.id, to = %peer_id, "Opened in-memory link");
        Ok(local)
    }

    async fn accept(&self) -> Result<Connection> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(ProtocolError::Closed)
    }
}
