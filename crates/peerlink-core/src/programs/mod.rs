//! Per-contact programs attached to authenticated channels.
//!
//! A [`ProgramRegistry`] holds `(predicate, factory)` pairs. When a channel
//! to a contact comes up, every entry whose predicate accepts the contact
//! produces a fresh [`ContactProgram`] instance. The instances then see the
//! channel's lifecycle:
//!
//! ```text
//! on_connected --> on_data* --> on_disconnected
//! ```
//!
//! The registry is an ordinary value owned by the connection manager, so
//! tests can build isolated registries.

mod chat;
mod heartbeat;

pub use chat::{ChatLog, ChatMessage, ChatProgram, Direction, send_message};
pub use heartbeat::HeartbeatProgram;

use crate::address::Address;
use crate::channel::{ChannelSender, PacketData};
use crate::contacts::Contact;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// What a program sees of its channel.
#[derive(Debug, Clone)]
pub struct ProgramContext {
    peer: Address,
    username: String,
    sender: ChannelSender,
}

impl ProgramContext {
    /// Create a context for an authenticated peer.
    pub fn new(peer: Address, username: impl Into<String>, sender: ChannelSender) -> Self {
        Self {
            peer,
            username: username.into(),
            sender,
        }
    }

    /// Verified peer address.
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Peer display name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Channel sending half.
    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Encrypt and send a packet to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed.
    pub async fn send(&self, packet: &PacketData) -> Result<()> {
        self.sender.send(packet).await
    }
}

/// Behaviour attached to one contact's channel.
#[async_trait]
pub trait ContactProgram: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// The channel is authenticated and its pump is about to start.
    async fn on_connected(&self, _ctx: &ProgramContext) -> Result<()> {
        Ok(())
    }

    /// A packet arrived.
    async fn on_data(&self, _ctx: &ProgramContext, _packet: &PacketData) -> Result<()> {
        Ok(())
    }

    /// The channel closed.
    async fn on_disconnected(&self, _ctx: &ProgramContext) {}
}

type Predicate = Arc<dyn Fn(&Contact) -> bool + Send + Sync>;
type Factory = Arc<dyn Fn(&Contact) -> Box<dyn ContactProgram> + Send + Sync>;

/// Ordered set of `(predicate, factory)` pairs.
#[derive(Clone, Default)]
pub struct ProgramRegistry {
    entries: Vec<(Predicate, Factory)>,
}

impl ProgramRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a program for contacts matching `predicate`.
    pub fn register<P, F>(&mut self, predicate: P, factory: F) -> &mut Self
    where
        P: Fn(&Contact) -> bool + Send + Sync + 'static,
        F: Fn(&Contact) -> Box<dyn ContactProgram> + Send + Sync + 'static,
    {
        self.entries.push((Arc::new(predicate), Arc::new(factory)));
        self
    }

    /// Add a program for every contact.
    pub fn register_all<F>(&mut self, factory: F) -> &mut Self
    where
        F: Fn(&Contact) -> Box<dyn ContactProgram> + Send + Sync + 'static,
    {
        self.register(|_| true, factory)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fresh program instances for `contact`.
    pub fn instantiate(&self, contact: &Contact) -> ProgramSet {
        ProgramSet {
            programs: self
                .entries
                .iter()
                .filter(|(predicate, _)| predicate(contact))
                .map(|(_, factory)| factory(contact))
                .collect(),
        }
    }
}

impl fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Programs running on one channel.
pub struct ProgramSet {
    programs: Vec<Box<dyn ContactProgram>>,
}

impl ProgramSet {
    /// Names of the running programs.
    pub fn names(&self) -> Vec<&'static str> {
        self.programs.iter().map(|p| p.name()).collect()
    }

    /// Notify every program of the connection. Failures are logged.
    pub async fn on_connected(&self, ctx: &ProgramContext) {
        for program in &self.programs {
            if let Err(e) = program.on_connected(ctx).await {
                tracing::warn!(program = program.name(), peer = %ctx.peer().id(), "Program failed to start: {}", e);
            }
        }
    }

    /// Hand a packet to every program. Failures are logged.
    pub async fn on_data(&self, ctx: &ProgramContext, packet: &PacketData) {
        for program in &self.programs {
            if let Err(e) = program.on_data(ctx, packet).await {
                tracing::warn!(program = program.name(), kind = %packet.kind, "Program rejected packet: {}", e);
            }
        }
    }

    /// Notify every program of the disconnection.
    pub async fn on_disconnected(&self, ctx: &ProgramContext) {
        for program in &self.programs {
            program.on_disconnected(ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{identity_a, identity_b};
    use crate::transport::Message;

    struct Named(&'static str);

    #[async_trait]
    impl ContactProgram for Named {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn test_predicates_select_programs() {
        let alice_id = identity_a().address().id().to_string();
        let mut registry = ProgramRegistry::new();
        registry
            .register_all(|_| Box::new(Named("everyone")))
            .register(
                move |contact| contact.id() == alice_id,
                |_| Box::new(Named("alice-only")),
            );
        assert_eq!(registry.len(), 2);

        let alice = Contact::new(identity_a().address().clone(), "alice", Message::Null);
        let bob = Contact::new(identity_b().address().clone(), "bob", Message::Null);
        assert_eq!(
            registry.instantiate(&alice).names(),
            vec!["everyone", "alice-only"]
        );
        assert_eq!(registry.instantiate(&bob).names(), vec!["everyone"]);
    }

    #[test]
    fn test_registries_are_isolated() {
        let mut first = ProgramRegistry::new();
        first.register_all(|_| Box::new(Named("one")));
        let second = ProgramRegistry::new();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
