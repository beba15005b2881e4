//! # PeerLink Core
//!
//! Mutual authentication and key negotiation for peer-to-peer links.
//!
//! PeerLink turns an unauthenticated, message-oriented duplex transport (a
//! WebRTC-style data channel) into an end-to-end encrypted channel bound to
//! self-certifying peer identities.
//!
//! This crate provides:
//! - Addresses whose id is derived from the RSA identity key
//! - The challenge/response primitive proving identity key possession
//! - The six-stage negotiation state machine (initiator and responder)
//! - Secure channels with an ordered asynchronous decryption pipeline
//! - A connection manager with a generation-checked registry and per-contact programs
//! - An in-memory transport with latency and duplication for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ConnectionManager                           │
//! │   (registry, contacts, programs: heartbeat, chat)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      SecureChannel                              │
//! │   (AES-256-GCM packets, ordered decryption pipeline)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    NegotiationEngine                            │
//! │   (identity claims, 2x HandshakeChallenge, nonce-bound ECDH)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Connection / Signaling                          │
//! │   (transport contract, duplicate suppression)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use peerlink_core::config::NegotiationConfig;
//! use peerlink_core::identity::Identity;
//! use peerlink_core::memory::MemoryNetwork;
//! use peerlink_core::negotiation::NegotiationEngine;
//! use peerlink_core::transport::Message;
//!
//! # async fn example() -> peerlink_core::Result<()> {
//! let alice = Identity::generate("alice")?;
//! let bob = Identity::generate("bob")?;
//! let (mut a, mut b) = MemoryNetwork::new().link(alice.address().id(), bob.address().id());
//!
//! let mut initiator = NegotiationEngine::initiator(NegotiationConfig::default());
//! let mut responder = NegotiationEngine::responder(NegotiationConfig::default());
//! let (ours, theirs) = tokio::join!(
//!     initiator.run(&mut a, &alice, None, &Message::Null),
//!     responder.run(&mut b, &bob, None, &Message::Null),
//! );
//! assert!(ours?.session_key.same_key(&theirs?.session_key));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod address;
pub mod channel;
pub mod config;
pub mod contacts;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod manager;
pub mod memory;
pub mod negotiation;
pub mod pipeline;
pub mod programs;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use address::{Address, AddressRecord, PossessionProof, UnverifiedAddress, VerifiedAddress};
pub use channel::{ChannelEvent, ChannelSender, ChannelStream, PacketData, SecureChannel};
pub use config::{ChannelConfig, HeartbeatConfig, NegotiationConfig, NodeConfig};
pub use contacts::{Contact, ContactStore, MemoryContactStore};
pub use error::{ProtocolError, Result};
pub use handshake::HandshakeChallenge;
pub use identity::{ContactDescriptor, Identity, IdentityRecord};
pub use manager::{ConnectionManager, ConnectionRegistry, PeerHandle};
pub use memory::{LinkConditions, MemoryNetwork, MemorySignaling};
pub use negotiation::{Negotiated, NegotiationEngine, NegotiationState, Role};
pub use transport::{Connection, FrameSink, LinkEvent, Message, Signaling};
