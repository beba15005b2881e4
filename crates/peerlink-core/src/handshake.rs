//! One-directional challenge proving possession of an identity private key.
//!
//! ```text
//! Poser                                         Answerer
//!   |-- {stage:0, challenge: E(peer, c)} ---------->|  decrypt with own key
//!   |<--------- {stage:1, response: E(poser, c)} ---|  re-encrypt for poser
//!   |  decrypt, compare with c                      |
//!   |-- {stage:2} --------------------------------->|
//! ```
//!
//! `c` is 190 random bytes, exactly one RSA-OAEP block. The poser keeps `c`
//! and the answerer keeps the recovered plaintext; negotiation later binds
//! both into the messaging key exchange.

use crate::address::{PossessionProof, UnverifiedAddress};
use crate::error::{ProtocolError, Result};
use crate::transport::Connection;
use crate::wire;
use peerlink_crypto::constant_time::ct_eq;
use peerlink_crypto::random::random_challenge;
use peerlink_crypto::{IdentityKeyPair, RSA_BLOCK_SIZE};
use std::time::Duration;
use zeroize::Zeroizing;

/// Result of posing a challenge.
#[derive(Debug)]
pub struct Posed {
    /// Proof that the peer holds the claimed key
    pub proof: PossessionProof,
    /// Challenge plaintext generated locally
    pub challenge: Zeroizing<Vec<u8>>,
}

/// Result of answering a challenge.
#[derive(Debug)]
pub struct Answered {
    /// Challenge plaintext recovered with the local private key
    pub recovered: Zeroizing<Vec<u8>>,
}

/// Challenge runner bound to the local identity and the peer's claimed key.
pub struct HandshakeChallenge<'a> {
    local: &'a IdentityKeyPair,
    peer: &'a UnverifiedAddress,
    timeout: Duration,
}

impl<'a> HandshakeChallenge<'a> {
    /// Create a runner; `timeout` bounds each wait for the peer.
    pub fn new(local: &'a IdentityKeyPair, peer: &'a UnverifiedAddress, timeout: Duration) -> Self {
        Self {
            local,
            peer,
            timeout,
        }
    }

    /// Challenge the peer to prove it holds its claimed identity key.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::MalformedHandshake`] if the response has the wrong shape or length
    /// - [`ProtocolError::IllegitimateKey`] if the response does not decrypt to the challenge
    /// - [`ProtocolError::ResponseTimeout`] if no response arrives in time
    pub async fn pose(&self, conn: &mut Connection) -> Result<Posed> {
        let peer_key = self.peer.identity_key()?;
        let challenge = Zeroizing::new(random_challenge()?);
        let encrypted = peer_key.encrypt_block(&challenge)?;
        conn.send(wire::handshake_challenge(encrypted)).await?;

        let message = conn
            .recv_timeout(self.timeout, "handshake response")
            .await?;
        let response = wire::parse_handshake_response(&message)?;
        if response.len() != RSA_BLOCK_SIZE {
            return Err(ProtocolError::malformed_handshake(
                "response is not one RSA block",
            ));
        }

        let echoed = Zeroizing::new(
            self.local
                .decrypt_block(response)
                .map_err(|_| ProtocolError::IllegitimateKey)?,
        );
        if !ct_eq(&echoed, &challenge) {
            tracing::warn!(peer = %self.peer.id(), "Handshake echo does not match challenge");
            return Err(ProtocolError::IllegitimateKey);
        }

        conn.send(wire::handshake_confirm()).await?;
        tracing::debug!(peer = %self.peer.id(), "Peer proved identity key possession");

        Ok(Posed {
            proof: PossessionProof::new(self.peer.id()),
            challenge,
        })
    }

    /// Answer the peer's challenge with the local private key.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::MalformedHandshake`] if a message has the wrong
    ///   shape or the challenge does not decrypt under the local key
    /// - [`ProtocolError::ResponseTimeout`] if the peer stalls
    pub async fn answer(&self, conn: &mut Connection) -> Result<Answered> {
        let peer_key = self.peer.identity_key()?;

        let message = conn
            .recv_timeout(self.timeout, "handshake challenge")
            .await?;
        let challenge = wire::parse_handshake_challenge(&message)?;
        if challenge.len() != RSA_BLOCK_SIZE {
            return Err(ProtocolError::malformed_handshake(
                "challenge is not one RSA block",
            ));
        }

        let recovered = Zeroizing::new(self.local.decrypt_block(challenge).map_err(|_| {
            ProtocolError::malformed_handshake("challenge was not encrypted to the local key")
        })?);
        let response = peer_key.encrypt_block(&recovered)?;
        conn.send(wire::handshake_response(response)).await?;

        let message = conn
            .recv_timeout(self.timeout, "handshake confirmation")
            .await?;
        wire::parse_handshake_confirm(&message)?;

        Ok(Answered { recovered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::VerifiedAddress;
    use crate::memory::MemoryNetwork;
    use crate::test_support::{identity_a, identity_b};
    use crate::transport::Signaling;
    use peerlink_crypto::KeyCodec;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn claim_of(identity: &crate::identity::Identity) -> UnverifiedAddress {
        let record = identity.keys().public_key().export_key();
        UnverifiedAddress::claim(&record, identity.address().id()).unwrap()
    }

    async fn linked() -> (Connection, Connection) {
        let network = MemoryNetwork::new();
        let a = network.endpoint(identity_a().address().id());
        let b = network.endpoint(identity_b().address().id());
        let outbound = a.connect(b.local_id()).await.unwrap();
        let inbound = b.accept().await.unwrap();
        (outbound, inbound)
    }

    #[tokio::test]
    async fn test_challenge_succeeds() {
        let (mut a_conn, mut b_conn) = linked().await;
        let b_claim = claim_of(identity_b());
        let a_claim = claim_of(identity_a());

        let poser = HandshakeChallenge::new(identity_a().keys(), &b_claim, TIMEOUT);
        let answerer = HandshakeChallenge::new(identity_b().keys(), &a_claim, TIMEOUT);
        let (posed, answered) = tokio::join!(poser.pose(&mut a_conn), answerer.answer(&mut b_conn));
        let posed = posed.unwrap();
        let answered = answered.unwrap();

        assert_eq!(posed.challenge.len(), 190);
        assert_eq!(posed.challenge.as_slice(), answered.recovered.as_slice());
        assert!(VerifiedAddress::verify(b_claim, posed.proof).is_ok());
    }

    #[tokio::test]
    async fn test_impostor_fails_with_illegitimate_key() {
        // The far end claims B's key without holding B's private key.
        let (mut a_conn, mut b_conn) = linked().await;
        let b_claim = claim_of(identity_b());
        let a_claim = claim_of(identity_a());

        let poser = HandshakeChallenge::new(identity_a().keys(), &b_claim, TIMEOUT);
        let impostor_task = async {
            let message = b_conn.recv().await.unwrap();
            assert!(wire::parse_handshake_challenge(&message).is_ok());
            // Cannot decrypt; echoes garbage of the right size instead.
            let forged = a_claim
                .identity_key()
                .unwrap()
                .encrypt_block(&[0u8; 190])
                .unwrap();
            b_conn.send(wire::handshake_response(forged)).await.unwrap();
        };
        let (posed, ()) = tokio::join!(poser.pose(&mut a_conn), impostor_task);
        assert!(matches!(posed, Err(ProtocolError::IllegitimateKey)));
    }

    #[tokio::test]
    async fn test_malformed_response_length() {
        let (mut a_conn, mut b_conn) = linked().await;
        let b_claim = claim_of(identity_b());
        let poser = HandshakeChallenge::new(identity_a().keys(), &b_claim, TIMEOUT);
        let peer = async {
            b_conn.recv().await.unwrap();
            b_conn
                .send(wire::handshake_response(vec![0u8; 128]))
                .await
                .unwrap();
        };
        let (posed, ()) = tokio::join!(poser.pose(&mut a_conn), peer);
        assert!(matches!(posed, Err(ProtocolError::MalformedHandshake(_))));
    }

    #[tokio::test]
    async fn test_wrong_stage_is_malformed() {
        let (mut a_conn, mut b_conn) = linked().await;
        let a_claim = claim_of(identity_a());
        let answerer = HandshakeChallenge::new(identity_b().keys(), &a_claim, TIMEOUT);
        a_conn.send(wire::handshake_confirm()).await.unwrap();
        assert!(matches!(
            answerer.answer(&mut b_conn).await,
            Err(ProtocolError::MalformedHandshake(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (mut a_conn, _b_conn) = linked().await;
        let b_claim = claim_of(identity_b());
        let poser = HandshakeChallenge::new(identity_a().keys(), &b_claim, TIMEOUT);
        let err = poser.pose(&mut a_conn).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
