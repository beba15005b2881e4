//! Connection manager: negotiation, registry and program lifecycle.
//!
//! # Architecture
//!
//! Live channels are stored in a concurrent [`ConnectionRegistry`] keyed by
//! peer address id. Each registration gets a fresh generation number:
//!
//! - the last registration for a peer id wins, so a connect racing an
//!   accept for the same peer leaves exactly one entry;
//! - disposal is compare-and-delete on the generation, so a superseded
//!   channel shutting down never removes its successor.
//!
//! # Connection Flow
//!
//! ```text
//! connect(id) / accept_next()
//!     |
//!     v
//! NegotiationEngine (initiator / responder)   -- failure: close link, return error
//!     |
//!     v
//! persist contact --> SecureChannel --> register(id) -> generation
//!     |
//!     v
//! programs.on_connected, then pump:  Data -> programs.on_data
//!                                    Closed -> programs.on_disconnected, dispose(id, generation)
//! ```

use crate::address::Address;
use crate::channel::{ChannelEvent, ChannelSender, ChannelStream, SecureChannel};
use crate::config::NodeConfig;
use crate::contacts::{Contact, ContactStore};
use crate::error::{ProtocolError, Result};
use crate::identity::Identity;
use crate::negotiation::{NegotiationEngine, Role};
use crate::programs::{ProgramContext, ProgramRegistry, ProgramSet};
use crate::transport::{Connection, Message, Signaling};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Peer id to value map with generation-checked removal.
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    entries: DashMap<String, (u64, T)>,
    next_generation: AtomicU64,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }
}

impl<T: Clone> ConnectionRegistry<T> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` for `peer_id`, replacing any earlier entry, and return
    /// the new generation.
    pub fn register(&self, peer_id: &str, value: T) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        if let Some((previous, _)) = self
            .entries
            .insert(peer_id.to_string(), (generation, value))
        {
            tracing::debug!(peer = %peer_id, previous, generation, "Superseded registry entry");
        }
        generation
    }

    /// Remove the entry for `peer_id` only if it still has `generation`.
    pub fn dispose(&self, peer_id: &str, generation: u64) -> bool {
        self.entries
            .remove_if(peer_id, |_, (current, _)| *current == generation)
            .is_some()
    }

    /// Current value for `peer_id`.
    pub fn get(&self, peer_id: &str) -> Option<T> {
        self.entries.get(peer_id).map(|entry| entry.value().1.clone())
    }

    /// Current generation for `peer_id`.
    pub fn generation(&self, peer_id: &str) -> Option<u64> {
        self.entries.get(peer_id).map(|entry| entry.value().0)
    }

    /// Registered peer ids.
    pub fn peer_ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An authenticated peer returned by [`ConnectionManager`].
#[derive(Debug)]
pub struct PeerHandle {
    /// Verified peer address, messaging key included
    pub peer: Address,
    /// Peer display name from its extra data, empty if absent
    pub username: String,
    /// Extra data the peer sent
    pub extra_data: Message,
    /// Channel sending half
    pub sender: ChannelSender,
    /// Registry generation of this channel
    pub generation: u64,
    /// Whether the peer was accepted on first contact
    pub first_contact: bool,
    /// SHA-256 fingerprint of the session key
    pub session_fingerprint: [u8; 32],
    closed: watch::Receiver<bool>,
}

impl PeerHandle {
    /// Address id of the peer.
    pub fn id(&self) -> &str {
        self.peer.id()
    }

    /// Wait until the channel has shut down and its programs have stopped.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
    }
}

struct ManagerInner {
    identity: Arc<Identity>,
    signaling: Arc<dyn Signaling>,
    contacts: Arc<dyn ContactStore>,
    programs: ProgramRegistry,
    config: NodeConfig,
    extra_data: Message,
    registry: ConnectionRegistry<ChannelSender>,
}

/// Owns the signaling endpoint, the contact store, the program registry
/// and every live channel of the local identity.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager.
    ///
    /// `extra_data` defaults to `{username: <identity username>}`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProtocolError::InvalidConfig`] if `config` is invalid.
    pub fn new(
        identity: Arc<Identity>,
        signaling: Arc<dyn Signaling>,
        contacts: Arc<dyn ContactStore>,
        programs: ProgramRegistry,
        config: NodeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let extra_data = Message::Map(vec![(
            Message::Text("username".into()),
            Message::Text(identity.username().to_string()),
        )]);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                identity,
                signaling,
                contacts,
                programs,
                config,
                extra_data,
                registry: ConnectionRegistry::new(),
            }),
        })
    }

    /// Id other peers use to reach this node.
    pub fn local_id(&self) -> &str {
        self.inner.signaling.local_id()
    }

    /// Local identity.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Live channel registry.
    pub fn registry(&self) -> &ConnectionRegistry<ChannelSender> {
        &self.inner.registry
    }

    /// Sending half of the live channel to `peer_id`.
    pub fn sender(&self, peer_id: &str) -> Option<ChannelSender> {
        self.inner.registry.get(peer_id)
    }

    /// Dial `peer_id` and negotiate as initiator.
    ///
    /// # Errors
    ///
    /// Any signaling or negotiation failure. The link is closed on failure.
    pub async fn connect(&self, peer_id: &str) -> Result<PeerHandle> {
        let conn = self.inner.signaling.connect(peer_id).await?;
        self.establish(conn, Role::Initiator).await
    }

    /// Accept the next inbound link and negotiate as responder.
    ///
    /// # Errors
    ///
    /// Any signaling or negotiation failure. The link is closed on failure.
    pub async fn accept_next(&self) -> Result<PeerHandle> {
        let conn = self.inner.signaling.accept().await?;
        self.establish(conn, Role::Responder).await
    }

    /// Accept inbound links until signaling shuts down.
    ///
    /// Each link negotiates on its own task, so a slow or silent dialer
    /// never delays the next one. Failed negotiations are logged and
    /// skipped; only the signaling endpoint closing stops the loop.
    pub fn spawn_acceptor(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let conn = match manager.inner.signaling.accept().await {
                    Ok(conn) => conn,
                    Err(ProtocolError::Closed) => {
                        tracing::debug!("Signaling closed, acceptor stopping");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Accepting inbound link failed: {}", e);
                        continue;
                    }
                };

                let manager = manager.clone();
                tokio::spawn(async move {
                    let dialer = conn.peer_id().to_string();
                    match manager.establish(conn, Role::Responder).await {
                        Ok(peer) => tracing::info!(peer = %peer.id(), "Accepted peer"),
                        Err(e) => {
                            tracing::warn!(peer = %dialer, "Inbound negotiation failed: {}", e);
                        }
                    }
                });
            }
        })
    }

    /// Close the live channel to `peer_id`, if any.
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        match self.inner.registry.get(peer_id) {
            Some(sender) => {
                sender.close().await;
                true
            }
            None => false,
        }
    }

    async fn establish(&self, mut conn: Connection, role: Role) -> Result<PeerHandle> {
        let inner = &self.inner;
        let known = inner
            .contacts
            .get(conn.peer_id())
            .await?
            .map(|contact| contact.address);

        let mut engine = NegotiationEngine::new(role, inner.config.negotiation.clone());
        let negotiated = match engine
            .run(&mut conn, &inner.identity, known.as_ref(), &inner.extra_data)
            .await
        {
            Ok(negotiated) => negotiated,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        let first_contact = negotiated.peer.is_first_contact();
        let peer = negotiated.peer.into_address();
        let username = negotiated
            .extra_data
            .as_map()
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|(k, _)| k.as_text() == Some("username"))
                    .and_then(|(_, v)| v.as_text())
            })
            .unwrap_or_default()
            .to_string();

        let contact = Contact::new(peer.clone(), username.clone(), negotiated.extra_data.clone());
        if let Err(e) = inner.contacts.put(contact.clone()).await {
            conn.close().await;
            return Err(e);
        }
        if first_contact {
            tracing::info!(peer = %peer.id(), %username, "Stored new contact");
        }

        let session_fingerprint = negotiated.session_key.fingerprint();
        let channel = SecureChannel::new(conn, negotiated.session_key, inner.config.channel.clone());
        let (sender, stream) = channel.into_stream();
        let generation = inner.registry.register(peer.id(), sender.clone());
        tracing::info!(peer = %peer.id(), generation, ?role, "Channel registered");

        let programs = inner.programs.instantiate(&contact);
        let ctx = ProgramContext::new(peer.clone(), username.clone(), sender.clone());
        programs.on_connected(&ctx).await;

        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(run_session(
            self.inner.clone(),
            stream,
            programs,
            ctx,
            generation,
            closed_tx,
        ));

        Ok(PeerHandle {
            peer,
            username,
            extra_data: negotiated.extra_data,
            sender,
            generation,
            first_contact,
            session_fingerprint,
            closed: closed_rx,
        })
    }
}

async fn run_session(
    inner: Arc<ManagerInner>,
    mut stream: ChannelStream,
    programs: ProgramSet,
    ctx: ProgramContext,
    generation: u64,
    closed: watch::Sender<bool>,
) {
    while let Some(event) = stream.next().await {
        match event {
            ChannelEvent::Data(packet) => programs.on_data(&ctx, &packet).await,
            ChannelEvent::Error(e) => {
                tracing::warn!(peer = %ctx.peer().id(), "Channel error: {}", e);
            }
            ChannelEvent::Closed => break,
        }
    }

    programs.on_disconnected(&ctx).await;
    let disposed = inner.registry.dispose(ctx.peer().id(), generation);
    tracing::info!(peer = %ctx.peer().id(), generation, disposed, "Channel closed");
    let _ = closed.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins() {
        let registry = ConnectionRegistry::<&'static str>::new();
        let first = registry.register("Apeer", "outbound");
        let second = registry.register("Apeer", "inbound");
        assert!(second > first);
        assert_eq!(registry.get("Apeer"), Some("inbound"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_dispose_keeps_newer_entry() {
        let registry = ConnectionRegistry::<u32>::new();
        let old = registry.register("Apeer", 1);
        let new = registry.register("Apeer", 2);

        assert!(!registry.dispose("Apeer", old));
        assert_eq!(registry.get("Apeer"), Some(2));
        assert_eq!(registry.generation("Apeer"), Some(new));

        assert!(registry.dispose("Apeer", new));
        assert!(registry.is_empty());
        assert!(!registry.dispose("Apeer", new));
    }

    #[test]
    fn test_concurrent_registrations_leave_one_entry() {
        let registry = Arc::new(ConnectionRegistry::<usize>::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let generation = registry.register("Apeer", i);
                    // Every writer tries to dispose its own entry once.
                    registry.dispose("Apeer", generation);
                    generation
                })
            })
            .collect();
        let generations: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut unique = generations.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), generations.len());
        assert!(registry.len() <= 1);
    }
}
