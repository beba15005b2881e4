//! Self-certifying peer addresses.
//!
//! An address id is a pure function of the identity key's RSA modulus:
//!
//! ```text
//! id = "A" + escape(base64url(n)) + "Z"        escape: "_" -> "0_", "-" -> "1-"
//! id = "-"                                     when no identity key is set
//! ```
//!
//! The escaping keeps ids usable as signaling-layer names. Two addresses are
//! the same peer iff their ids are equal.
//!
//! Ids arriving over the wire are claims. The claim-then-prove flow is carried
//! in the types: an [`UnverifiedAddress`] becomes a [`VerifiedAddress`] only
//! through a [`PossessionProof`], and only the handshake challenge can mint one.

use crate::error::{ProtocolError, Result};
use peerlink_crypto::{
    IdentityPublicKey, KeyCodec, KeyRecord, MessagingKeyPair, MessagingPublicKey, SessionKey,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Id of an address without an identity key.
pub const EMPTY_ID: &str = "-";

/// Compute the address id for an identity key.
#[must_use]
pub fn compute_id(identity_key: Option<&IdentityPublicKey>) -> String {
    match identity_key {
        None => EMPTY_ID.to_string(),
        Some(key) => {
            let n = key.modulus_b64();
            let mut id = String::with_capacity(n.len() + 8);
            id.push('A');
            for c in n.chars() {
                match c {
                    '_' => id.push_str("0_"),
                    '-' => id.push_str("1-"),
                    c => id.push(c),
                }
            }
            id.push('Z');
            id
        }
    }
}

/// Persisted form of an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    /// Identity public key
    pub identity_public_key: Option<KeyRecord>,
    /// Messaging public key
    pub messaging_public_key: Option<KeyRecord>,
}

/// The two public keys of a peer plus the id derived from the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    identity_key: Option<IdentityPublicKey>,
    messaging_key: Option<MessagingPublicKey>,
    id: String,
}

impl Default for Address {
    fn default() -> Self {
        Self::empty()
    }
}

impl Address {
    /// Address with no keys and the `-` id.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            identity_key: None,
            messaging_key: None,
            id: EMPTY_ID.to_string(),
        }
    }

    /// Address for a known identity key.
    #[must_use]
    pub fn from_identity_key(key: IdentityPublicKey) -> Self {
        let mut address = Self::empty();
        address.set_identity_key(key);
        address
    }

    /// Address id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identity public key, if set.
    #[must_use]
    pub fn identity_key(&self) -> Option<&IdentityPublicKey> {
        self.identity_key.as_ref()
    }

    /// Messaging public key, if set.
    #[must_use]
    pub fn messaging_key(&self) -> Option<&MessagingPublicKey> {
        self.messaging_key.as_ref()
    }

    /// Replace the identity key and recompute the id.
    pub fn set_identity_key(&mut self, key: IdentityPublicKey) {
        self.id = compute_id(Some(&key));
        self.identity_key = Some(key);
    }

    /// Import an identity key record and recompute the id.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KeyFormat`] if the record does not import.
    pub fn set_identity_record(&mut self, record: &KeyRecord) -> Result<()> {
        self.set_identity_key(IdentityPublicKey::import_key(record)?);
        Ok(())
    }

    /// Replace the messaging key.
    pub fn set_messaging_key(&mut self, key: MessagingPublicKey) {
        self.messaging_key = Some(key);
    }

    /// ECDH against the stored messaging key.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KeyAgreement`] if no messaging key is set.
    pub fn derive_session_secret(&self, local: &MessagingKeyPair) -> Result<SessionKey> {
        let peer = self.messaging_key.as_ref().ok_or(ProtocolError::KeyAgreement(
            Cow::Borrowed("peer messaging key has not been set"),
        ))?;
        Ok(local.agree(peer)?)
    }

    /// Whether both addresses name the same peer.
    #[must_use]
    pub fn is_same_peer(&self, other: &Address) -> bool {
        self.id == other.id
    }

    /// Canonical persisted form.
    #[must_use]
    pub fn to_record(&self) -> AddressRecord {
        AddressRecord {
            identity_public_key: self.identity_key.as_ref().map(KeyCodec::export_key),
            messaging_public_key: self.messaging_key.as_ref().map(KeyCodec::export_key),
        }
    }

    /// Restore from the persisted form, recomputing the id.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KeyFormat`] if either record does not import.
    pub fn from_record(record: &AddressRecord) -> Result<Self> {
        let mut address = Self::empty();
        if let Some(identity) = &record.identity_public_key {
            address.set_identity_record(identity)?;
        }
        if let Some(messaging) = &record.messaging_public_key {
            address.set_messaging_key(MessagingPublicKey::import_key(messaging)?);
        }
        Ok(address)
    }
}

/// Evidence that a peer decrypted a challenge posed to its identity key.
#[derive(Debug)]
pub struct PossessionProof {
    subject: String,
}

impl PossessionProof {
    pub(crate) fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
        }
    }

    /// Id of the address the proof was obtained for.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Peer address whose identity key is claimed but not yet proven.
#[derive(Debug, Clone)]
pub struct UnverifiedAddress {
    address: Address,
    first_contact: bool,
}

impl UnverifiedAddress {
    /// Accept a wire-supplied identity key, provided it hashes to the peer id
    /// the signaling layer reported for this connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KeyFormat`] if the record does not import and
    /// [`ProtocolError::IllegitimateAddressKey`] if the ids differ.
    pub fn claim(record: &KeyRecord, expected_peer_id: &str) -> Result<Self> {
        let mut address = Address::empty();
        address.set_identity_record(record)?;
        Self::check_id(&address, expected_peer_id)?;
        Ok(Self {
            address,
            first_contact: true,
        })
    }

    /// Use an identity key trusted from an earlier session.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidState`] if the address has no identity
    /// key and [`ProtocolError::IllegitimateAddressKey`] if it is not the
    /// peer on this connection.
    pub fn from_known(address: &Address, expected_peer_id: &str) -> Result<Self> {
        if address.identity_key().is_none() {
            return Err(ProtocolError::invalid_state(
                "known address has no identity key",
            ));
        }
        Self::check_id(address, expected_peer_id)?;
        let mut address = address.clone();
        address.messaging_key = None;
        Ok(Self {
            address,
            first_contact: false,
        })
    }

    fn check_id(address: &Address, expected_peer_id: &str) -> Result<()> {
        if address.id() != expected_peer_id {
            return Err(ProtocolError::IllegitimateAddressKey {
                expected: expected_peer_id.to_string(),
                actual: address.id().to_string(),
            });
        }
        Ok(())
    }

    /// Claimed id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.address.id()
    }

    /// Claimed identity key.
    pub(crate) fn identity_key(&self) -> Result<&IdentityPublicKey> {
        self.address
            .identity_key()
            .ok_or(ProtocolError::invalid_state("unverified address lost its key"))
    }

    /// Whether the key came off the wire rather than from a stored contact.
    #[must_use]
    pub fn is_first_contact(&self) -> bool {
        self.first_contact
    }
}

/// Peer address whose identity key has passed a possession challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAddress {
    address: Address,
    first_contact: bool,
}

impl VerifiedAddress {
    /// Promote a claim using a proof obtained for the same id.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::IllegitimateKey`] if the proof was obtained
    /// for a different address.
    pub fn verify(claim: UnverifiedAddress, proof: PossessionProof) -> Result<Self> {
        if proof.subject != claim.address.id {
            return Err(ProtocolError::IllegitimateKey);
        }
        Ok(Self {
            address: claim.address,
            first_contact: claim.first_contact,
        })
    }

    /// Verified address.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Verified id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.address.id()
    }

    /// Verified identity key.
    ///
    /// # Errors
    ///
    /// Never fails for addresses built through [`VerifiedAddress::verify`].
    pub fn identity_key(&self) -> Result<&IdentityPublicKey> {
        self.address
            .identity_key()
            .ok_or(ProtocolError::invalid_state("verified address lost its key"))
    }

    /// True when the identity key was trusted on first use in this session
    /// rather than anchored by an earlier one.
    #[must_use]
    pub fn is_first_contact(&self) -> bool {
        self.first_contact
    }

    pub(crate) fn set_messaging_key(&mut self, key: MessagingPublicKey) {
        self.address.set_messaging_key(key);
    }

    /// ECDH against the peer's authenticated messaging key.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KeyAgreement`] before the messaging key exchange.
    pub fn derive_session_secret(&self, local: &MessagingKeyPair) -> Result<SessionKey> {
        self.address.derive_session_secret(local)
    }

    /// Unwrap the address.
    #[must_use]
    pub fn into_address(self) -> Address {
        self.address
    }
}
