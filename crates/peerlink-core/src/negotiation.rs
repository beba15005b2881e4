//! Mutual authentication and session key negotiation.
//!
//! One engine runs per connection, in the initiator role on the side that
//! dialed and the responder role on the side that accepted. Stages execute
//! strictly in sequence; each wait is bounded and a timeout is terminal.
//!
//! ```text
//! Initiator                                           Responder
//!     |<------------- 0: addressKey (responder) ---------|
//!     |-------------- 1: addressKey (initiator) -------->|
//!     |      both: check claimed key hashes to peer id   |
//!     |== challenge run 1: initiator poses ============>|
//!     |<============ challenge run 2: responder poses ===|
//!     |      [identity keys proven]                      |
//!     |-- 2: E(responder id key, {key, nonce}) --------->|
//!     |<--------- 3: E(initiator id key, {key, nonce}) --|
//!     |      both: nonce == own challenge, derive ECDH   |
//!     |      [messaging keys bound to identities]        |
//!     |-- 4: AES-GCM(extraData) ------------------------>|
//!     |<------------------------ 5: AES-GCM(extraData) --|
//!     |      [Authenticated]                             |
//! ```
//!
//! The nonce each side sends is the challenge plaintext it recovered while
//! answering; the receiver compares it against the challenge it posed. A
//! relay that swaps in its own messaging key cannot produce that value.
//!
//! On any error the engine ends in [`NegotiationState::Failed`]. Closing
//! the connection is left to the caller.

use crate::address::{Address, UnverifiedAddress, VerifiedAddress};
use crate::channel::{decode_value, encode_value};
use crate::config::NegotiationConfig;
use crate::error::{ProtocolError, Result};
use crate::handshake::{Answered, HandshakeChallenge, Posed};
use crate::identity::Identity;
use crate::transport::{Connection, Message};
use crate::wire;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use peerlink_crypto::constant_time::ct_eq;
use peerlink_crypto::{
    IdentityKeyPair, IdentityPublicKey, KeyCodec, KeyRecord, MessagingPublicKey, SessionKey,
    decrypt_large, encrypt_large,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which end of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that opened the connection
    Initiator,
    /// The side that accepted it
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Progress of one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// `run` has not been called
    NotStarted,
    /// Exchanging identity key claims
    AwaitingPeerIdentity,
    /// Running the two challenge directions
    VerifyingIdentity,
    /// Exchanging nonce-bound messaging keys
    AwaitingPeerMessagingKey,
    /// All checks passed
    Authenticated,
    /// Terminal failure; the connection must be closed
    Failed,
}

/// Outcome of a successful negotiation.
#[derive(Debug)]
pub struct Negotiated {
    /// Peer address with proven identity key and authenticated messaging key
    pub peer: VerifiedAddress,
    /// Session key for the secure channel
    pub session_key: SessionKey,
    /// Application payload the peer sent
    pub extra_data: Message,
}

/// Plaintext of stages 2 and 3.
#[derive(Debug, Serialize, Deserialize)]
struct MessageKeyPayload {
    key: KeyRecord,
    nonce: String,
}

/// Encrypt a messaging key and nonce binding to the peer's identity key.
///
/// # Errors
///
/// Returns an error if the payload cannot be encoded or encrypted.
pub fn encrypt_message_key(
    peer_identity: &IdentityPublicKey,
    messaging_key: &MessagingPublicKey,
    nonce: &[u8],
) -> Result<Vec<u8>> {
    let payload = MessageKeyPayload {
        key: messaging_key.export_key(),
        nonce: STANDARD.encode(nonce),
    };
    let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(&payload)?);
    Ok(encrypt_large(peer_identity, &plaintext)?)
}

/// Decrypt a messaging key payload and check its nonce against `challenge`.
///
/// # Errors
///
/// - [`ProtocolError::Decryption`] if the blocks do not decrypt
/// - [`ProtocolError::MalformedMessage`] if the plaintext is not a payload
/// - [`ProtocolError::InvalidNonce`] if the nonce is not `challenge`
/// - [`ProtocolError::KeyFormat`] if the key does not import
pub fn open_message_key(
    local_identity: &IdentityKeyPair,
    encrypted: &[u8],
    challenge: &[u8],
) -> Result<MessagingPublicKey> {
    let plaintext = zeroize::Zeroizing::new(decrypt_large(local_identity, encrypted)?);
    let payload: MessageKeyPayload = serde_json::from_slice(&plaintext)
        .map_err(|_| ProtocolError::malformed("messaging key payload is not valid"))?;
    let nonce = STANDARD
        .decode(payload.nonce.as_bytes())
        .map_err(|_| ProtocolError::malformed("nonce is not base64"))?;
    if !ct_eq(&nonce, challenge) {
        return Err(ProtocolError::InvalidNonce);
    }
    Ok(MessagingPublicKey::import_key(&payload.key)?)
}

/// Per-connection negotiation state machine.
#[derive(Debug)]
pub struct NegotiationEngine {
    role: Role,
    config: NegotiationConfig,
    state: NegotiationState,
}

impl NegotiationEngine {
    /// Engine for the dialing side.
    #[must_use]
    pub fn initiator(config: NegotiationConfig) -> Self {
        Self::new(Role::Initiator, config)
    }

    /// Engine for the accepting side.
    #[must_use]
    pub fn responder(config: NegotiationConfig) -> Self {
        Self::new(Role::Responder, config)
    }

    /// Engine for `role`.
    #[must_use]
    pub fn new(role: Role, config: NegotiationConfig) -> Self {
        Self {
            role,
            config,
            state: NegotiationState::NotStarted,
        }
    }

    /// Role of this engine.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Run the whole negotiation over `conn`.
    ///
    /// `known` is the stored address of the peer when it is already a
    /// contact; its identity key is then used instead of the one the peer
    /// sends. `extra_data` is delivered to the peer once the session key is
    /// live.
    ///
    /// # Errors
    ///
    /// Any stage failure, see [`ProtocolError`]. The engine is left in
    /// [`NegotiationState::Failed`] and the caller must close `conn`.
    pub async fn run(
        &mut self,
        conn: &mut Connection,
        local: &Identity,
        known: Option<&Address>,
        extra_data: &Message,
    ) -> Result<Negotiated> {
        if self.state != NegotiationState::NotStarted {
            return Err(ProtocolError::invalid_state("negotiation already ran"));
        }

        match self.drive(conn, local, known, extra_data).await {
            Ok(negotiated) => {
                self.state = NegotiationState::Authenticated;
                tracing::info!(
                    role = %self.role,
                    peer = %negotiated.peer.id(),
                    first_contact = negotiated.peer.is_first_contact(),
                    "Negotiation complete"
                );
                Ok(negotiated)
            }
            Err(e) => {
                tracing::warn!(role = %self.role, peer = %conn.peer_id(), state = ?self.state, "Negotiation failed: {}", e);
                self.state = NegotiationState::Failed;
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        conn: &mut Connection,
        local: &Identity,
        known: Option<&Address>,
        extra_data: &Message,
    ) -> Result<Negotiated> {
        // Stages 0 and 1: identity key claims
        self.state = NegotiationState::AwaitingPeerIdentity;
        let claim = self.exchange_identity(conn, local, known).await?;

        // Both challenge directions
        self.state = NegotiationState::VerifyingIdentity;
        let (posed, answered) = self.verify_identity(conn, local, &claim).await?;
        let mut peer = VerifiedAddress::verify(claim, posed.proof)?;
        tracing::debug!(role = %self.role, peer = %peer.id(), "Identity keys proven");

        // Stages 2 and 3: nonce-bound messaging keys
        self.state = NegotiationState::AwaitingPeerMessagingKey;
        let peer_messaging = self
            .exchange_messaging_keys(conn, local, &peer, &posed.challenge, &answered)
            .await?;
        peer.set_messaging_key(peer_messaging);
        let session_key = peer.derive_session_secret(local.messaging())?;
        tracing::debug!(role = %self.role, session = ?session_key, "Session key derived");

        // Stages 4 and 5: encrypted application payload
        let extra_data = self
            .exchange_extra_data(conn, &session_key, extra_data)
            .await?;

        Ok(Negotiated {
            peer,
            session_key,
            extra_data,
        })
    }

    async fn exchange_identity(
        &self,
        conn: &mut Connection,
        local: &Identity,
        known: Option<&Address>,
    ) -> Result<UnverifiedAddress> {
        let own_record = local.keys().public_key().export_key();
        let first_wait = self.config.first_response_timeout;

        let peer_record = match self.role {
            Role::Responder => {
                conn.send(wire::negotiation_address_key(0, &own_record)?)
                    .await?;
                let message = conn.recv_timeout(first_wait, "negotiation stage 1").await?;
                wire::parse_address_key(&message, 1)?
            }
            Role::Initiator => {
                let message = conn.recv_timeout(first_wait, "negotiation stage 0").await?;
                let record = wire::parse_address_key(&message, 0)?;
                conn.send(wire::negotiation_address_key(1, &own_record)?)
                    .await?;
                record
            }
        };

        match known {
            Some(address) => UnverifiedAddress::from_known(address, conn.peer_id()),
            None => {
                let claim = UnverifiedAddress::claim(&peer_record, conn.peer_id())?;
                tracing::warn!(
                    peer = %claim.id(),
                    "Trusting identity key on first contact; id match proves key control only"
                );
                Ok(claim)
            }
        }
    }

    async fn verify_identity(
        &self,
        conn: &mut Connection,
        local: &Identity,
        claim: &UnverifiedAddress,
    ) -> Result<(Posed, Answered)> {
        let challenge = HandshakeChallenge::new(local.keys(), claim, self.config.handshake_timeout);
        match self.role {
            Role::Initiator => {
                let posed = challenge.pose(conn).await?;
                let answered = challenge.answer(conn).await?;
                Ok((posed, answered))
            }
            Role::Responder => {
                let answered = challenge.answer(conn).await?;
                let posed = challenge.pose(conn).await?;
                Ok((posed, answered))
            }
        }
    }

    async fn exchange_messaging_keys(
        &self,
        conn: &mut Connection,
        local: &Identity,
        peer: &VerifiedAddress,
        own_challenge: &[u8],
        answered: &Answered,
    ) -> Result<MessagingPublicKey> {
        let outgoing = encrypt_message_key(
            peer.identity_key()?,
            local.messaging().public_key(),
            &answered.recovered,
        )?;
        let timeout = self.config.stage_timeout;

        let incoming = match self.role {
            Role::Initiator => {
                conn.send(wire::negotiation_message_key(2, outgoing)).await?;
                let message = conn.recv_timeout(timeout, "negotiation stage 3").await?;
                wire::parse_message_key(&message, 3)?.to_vec()
            }
            Role::Responder => {
                let message = conn.recv_timeout(timeout, "negotiation stage 2").await?;
                let incoming = wire::parse_message_key(&message, 2)?.to_vec();
                conn.send(wire::negotiation_message_key(3, outgoing)).await?;
                incoming
            }
        };

        open_message_key(local.keys(), &incoming, own_challenge)
    }

    async fn exchange_extra_data(
        &self,
        conn: &mut Connection,
        session_key: &SessionKey,
        extra_data: &Message,
    ) -> Result<Message> {
        let outgoing = session_key.seal(&encode_value(extra_data)?)?;
        let timeout = self.config.extra_data_timeout;

        let incoming = match self.role {
            Role::Initiator => {
                conn.send(wire::negotiation_extra_data(4, &outgoing)).await?;
                let message = conn.recv_timeout(timeout, "negotiation stage 5").await?;
                wire::parse_extra_data(&message, 5)?
            }
            Role::Responder => {
                let message = conn.recv_timeout(timeout, "negotiation stage 4").await?;
                let incoming = wire::parse_extra_data(&message, 4)?;
                conn.send(wire::negotiation_extra_data(5, &outgoing)).await?;
                incoming
            }
        };

        decode_value(&session_key.open(&incoming)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::test_support::{identity_a, identity_b, identity_c};
    use std::time::Duration;

    fn extra(name: &str) -> Message {
        Message::Map(vec![(
            Message::Text("username".into()),
            Message::Text(name.into()),
        )])
    }

    #[tokio::test]
    async fn test_both_sides_authenticate() {
        let network = MemoryNetwork::new();
        let (mut a_conn, mut b_conn) =
            network.link(identity_a().address().id(), identity_b().address().id());

        let mut initiator = NegotiationEngine::initiator(NegotiationConfig::default());
        let mut responder = NegotiationEngine::responder(NegotiationConfig::default());
        assert_eq!(initiator.state(), NegotiationState::NotStarted);

        let a_extra = extra("alice");
        let b_extra = extra("bob");
        let (a, b) = tokio::join!(
            initiator.run(&mut a_conn, identity_a(), None, &a_extra),
            responder.run(&mut b_conn, identity_b(), None, &b_extra),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(initiator.state(), NegotiationState::Authenticated);
        assert_eq!(responder.state(), NegotiationState::Authenticated);
        assert!(a.session_key.same_key(&b.session_key));
        assert_eq!(a.extra_data, b_extra);
        assert_eq!(b.extra_data, a_extra);
        assert_eq!(a.peer.id(), identity_b().address().id());
        assert_eq!(b.peer.id(), identity_a().address().id());
        assert!(a.peer.is_first_contact());
    }

    #[tokio::test]
    async fn test_known_contact_skips_import() {
        let network = MemoryNetwork::new();
        let (mut a_conn, mut b_conn) =
            network.link(identity_a().address().id(), identity_b().address().id());
        let mut initiator = NegotiationEngine::initiator(NegotiationConfig::default());
        let mut responder = NegotiationEngine::responder(NegotiationConfig::default());

        let known_b = identity_b().address().clone();
        let (a, b) = tokio::join!(
            initiator.run(&mut a_conn, identity_a(), Some(&known_b), &Message::Null),
            responder.run(&mut b_conn, identity_b(), None, &Message::Null),
        );
        let a = a.unwrap();
        assert!(!a.peer.is_first_contact());
        assert!(a.session_key.same_key(&b.unwrap().session_key));
    }

    #[tokio::test]
    async fn test_peer_id_mismatch_is_illegitimate_address_key() {
        // Signaling says the initiator reached C, but B answers.
        let network = MemoryNetwork::new();
        let (mut a_conn, mut b_conn) =
            network.link(identity_a().address().id(), identity_c().address().id());
        let mut initiator = NegotiationEngine::initiator(NegotiationConfig::default());
        let mut responder = NegotiationEngine::responder(NegotiationConfig {
            first_response_timeout: Duration::from_millis(500),
            ..NegotiationConfig::default()
        });

        let (a, _) = tokio::join!(
            async {
                let result = initiator
                    .run(&mut a_conn, identity_a(), None, &Message::Null)
                    .await;
                a_conn.close().await;
                result
            },
            async {
                let result = responder
                    .run(&mut b_conn, identity_b(), None, &Message::Null)
                    .await;
                b_conn.close().await;
                result
            },
        );
        assert!(matches!(
            a,
            Err(ProtocolError::IllegitimateAddressKey { .. })
        ));
        assert_eq!(initiator.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let network = MemoryNetwork::new();
        let (mut a_conn, _b_conn) = network.link("Aa", "Ab");
        let mut engine = NegotiationEngine::initiator(NegotiationConfig {
            first_response_timeout: Duration::from_millis(10),
            ..NegotiationConfig::default()
        });
        assert!(
            engine
                .run(&mut a_conn, identity_a(), None, &Message::Null)
                .await
                .unwrap_err()
                .is_timeout()
        );
        assert!(matches!(
            engine
                .run(&mut a_conn, identity_a(), None, &Message::Null)
                .await,
            Err(ProtocolError::InvalidState(_))
        ));
    }

    #[test]
    fn test_message_key_nonce_binding() {
        let identity = identity_a();
        let messaging = peerlink_crypto::MessagingKeyPair::generate();
        let nonce = [0x33u8; 190];
        let sealed =
            encrypt_message_key(identity.keys().public_key(), messaging.public_key(), &nonce)
                .unwrap();

        let opened = open_message_key(identity.keys(), &sealed, &nonce).unwrap();
        assert_eq!(&opened, messaging.public_key());

        assert!(matches!(
            open_message_key(identity.keys(), &sealed, &[0x34u8; 190]),
            Err(ProtocolError::InvalidNonce)
        ));
    }

    #[test]
    fn test_message_key_wrong_recipient() {
        let messaging = peerlink_crypto::MessagingKeyPair::generate();
        let sealed = encrypt_message_key(
            identity_a().keys().public_key(),
            messaging.public_key(),
            &[1u8; 190],
        )
        .unwrap();
        assert!(matches!(
            open_message_key(identity_b().keys(), &sealed, &[1u8; 190]),
            Err(ProtocolError::Decryption(_))
        ));
    }
}
