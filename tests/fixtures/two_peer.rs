//! Two-peer fixture for integration testing
//!
//! Wires alice and bob to one [`MemoryNetwork`], each with its own
//! [`ConnectionManager`], contact store and chat log.
//!
//! # Example
//!
//! ```no_run
//! use peerlink_integration_tests::TwoPeerFixture;
//!
//! # async fn example() -> peerlink_core::Result<()> {
//! let fixture = TwoPeerFixture::new()?;
//! let (to_bob, to_alice) = fixture.connect().await?;
//! assert_eq!(to_bob.session_fingerprint, to_alice.session_fingerprint);
//! # Ok(())
//! # }
//! ```

use super::{identity_a, identity_b};
use peerlink_core::programs::{ChatLog, ChatProgram, HeartbeatProgram, ProgramRegistry};
use peerlink_core::{
    ConnectionManager, Identity, LinkConditions, MemoryContactStore, MemoryNetwork, NodeConfig,
    PeerHandle, Result,
};
use std::sync::Arc;

/// One side of the fixture.
pub struct Peer {
    /// Connection manager
    pub manager: ConnectionManager,
    /// Inbound and outbound chat messages
    pub log: ChatLog,
    /// Contacts learned through negotiation
    pub contacts: Arc<MemoryContactStore>,
}

impl Peer {
    fn new(network: &MemoryNetwork, identity: Arc<Identity>, config: &NodeConfig) -> Result<Self> {
        let log = ChatLog::new();
        let contacts = Arc::new(MemoryContactStore::new());
        let heartbeat = config.heartbeat.clone();
        let chat_log = log.clone();

        let mut programs = ProgramRegistry::new();
        programs
            .register_all(move |_| Box::new(HeartbeatProgram::new(heartbeat.clone())))
            .register_all(move |_| Box::new(ChatProgram::new(chat_log.clone())));

        let signaling = Arc::new(network.endpoint(identity.address().id()));
        let manager = ConnectionManager::new(
            identity,
            signaling,
            contacts.clone(),
            programs,
            config.clone(),
        )?;
        Ok(Self {
            manager,
            log,
            contacts,
        })
    }

    /// Address id of this peer.
    pub fn id(&self) -> &str {
        self.manager.local_id()
    }
}

/// Alice and bob on a shared simulated network.
pub struct TwoPeerFixture {
    /// Network both endpoints are registered on
    pub network: MemoryNetwork,
    /// Initiating side
    pub alice: Peer,
    /// Accepting side
    pub bob: Peer,
}

impl TwoPeerFixture {
    /// Fixture over instant, lossless links.
    ///
    /// # Errors
    ///
    /// Returns an error if the default configuration is rejected.
    pub fn new() -> Result<Self> {
        Self::with_conditions(LinkConditions::default(), NodeConfig::default())
    }

    /// Fixture whose links follow `conditions`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn with_conditions(conditions: LinkConditions, config: NodeConfig) -> Result<Self> {
        let network = MemoryNetwork::with_conditions(conditions);
        let alice = Peer::new(&network, identity_a(), &config)?;
        let bob = Peer::new(&network, identity_b(), &config)?;
        Ok(Self {
            network,
            alice,
            bob,
        })
    }

    /// Alice dials bob; returns alice's handle for bob and bob's for alice.
    ///
    /// # Errors
    ///
    /// Returns the first negotiation failure of either side.
    pub async fn connect(&self) -> Result<(PeerHandle, PeerHandle)> {
        let (outbound, inbound) = tokio::join!(
            self.alice.manager.connect(self.bob.id()),
            self.bob.manager.accept_next(),
        );
        Ok((outbound?, inbound?))
    }
}
