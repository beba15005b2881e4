//! Local identity and its persisted forms.
//!
//! An identity pairs a long-lived RSA-OAEP identity key (which defines the
//! address id) with an ECDH P-256 messaging key used for session agreement.
//!
//! # Persistence
//!
//! The private halves are stored as an [`IdentityRecord`] (JSON) sealed
//! under a passphrase with Argon2id + XChaCha20-Poly1305. Only the public
//! identity key and username ever leave the device, as an export descriptor:
//!
//! ```text
//! base64( JSON [ <identity key record>, "<username>" ] )
//! ```
//!
//! # Example
//!
//! ```no_run
//! use peerlink_core::identity::{ContactDescriptor, Identity};
//!
//! let identity = Identity::generate("alice")?;
//! let descriptor = identity.export_descriptor()?;
//!
//! let contact = ContactDescriptor::parse(&descriptor)?;
//! assert_eq!(contact.address.id(), identity.address().id());
//! # Ok::<(), peerlink_core::ProtocolError>(())
//! ```

use crate::address::Address;
use crate::error::{ProtocolError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use peerlink_crypto::{
    IdentityKeyPair, KeyCodec, KeyEncryptionParams, KeyRecord, MessagingKeyPair, SealedBlob,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// The local peer: username, key pairs and the derived address.
pub struct Identity {
    username: String,
    keys: IdentityKeyPair,
    messaging: MessagingKeyPair,
    address: Address,
}

impl Identity {
    /// Generate fresh identity and messaging keys.
    ///
    /// # Errors
    ///
    /// Returns an error if RSA key generation fails.
    pub fn generate(username: impl Into<String>) -> Result<Self> {
        let keys = IdentityKeyPair::generate()?;
        Ok(Self::from_parts(
            username,
            keys,
            MessagingKeyPair::generate(),
        ))
    }

    /// Assemble an identity from existing key pairs.
    pub fn from_parts(
        username: impl Into<String>,
        keys: IdentityKeyPair,
        messaging: MessagingKeyPair,
    ) -> Self {
        let address = Address::from_identity_key(keys.public_key().clone());
        Self {
            username: username.into(),
            keys,
            messaging,
            address,
        }
    }

    /// Display name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Identity key pair.
    pub fn keys(&self) -> &IdentityKeyPair {
        &self.keys
    }

    /// Messaging key pair.
    pub fn messaging(&self) -> &MessagingKeyPair {
        &self.messaging
    }

    /// Own address. Carries the identity key only.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Private persisted form.
    ///
    /// # Errors
    ///
    /// Returns an error if a key cannot be encoded.
    pub fn to_record(&self) -> Result<IdentityRecord> {
        let identity_der = self.keys.to_pkcs8_der()?;
        let messaging = self.messaging.to_bytes();
        Ok(IdentityRecord {
            username: self.username.clone(),
            identity_key: STANDARD.encode(identity_der.as_slice()),
            messaging_key: STANDARD.encode(messaging.as_slice()),
        })
    }

    /// Restore from the private persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KeyFormat`] if either key does not decode.
    pub fn from_record(record: &IdentityRecord) -> Result<Self> {
        let identity_der = Zeroizing::new(
            STANDARD
                .decode(record.identity_key.as_bytes())
                .map_err(|e| ProtocolError::KeyFormat(format!("identity key: {e}")))?,
        );
        let messaging = Zeroizing::new(
            STANDARD
                .decode(record.messaging_key.as_bytes())
                .map_err(|e| ProtocolError::KeyFormat(format!("messaging key: {e}")))?,
        );
        Ok(Self::from_parts(
            record.username.clone(),
            IdentityKeyPair::from_pkcs8_der(&identity_der)?,
            MessagingKeyPair::from_bytes(&messaging)?,
        ))
    }

    /// Seal the private record under `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or key derivation fails.
    pub fn seal(&self, passphrase: &[u8], params: KeyEncryptionParams) -> Result<SealedBlob> {
        let json = Zeroizing::new(serde_json::to_vec(&self.to_record()?)?);
        Ok(SealedBlob::seal(&json, passphrase, params)?)
    }

    /// Open a sealed identity.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decryption`] for a wrong passphrase or a
    /// tampered blob.
    pub fn unseal(blob: &SealedBlob, passphrase: &[u8]) -> Result<Self> {
        let json = blob.open(passphrase)?;
        let record: IdentityRecord = serde_json::from_slice(&json)?;
        Self::from_record(&record)
    }

    /// Seal and write to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Storage`] if the file cannot be written.
    pub fn save(
        &self,
        path: impl AsRef<Path>,
        passphrase: &[u8],
        params: KeyEncryptionParams,
    ) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.seal(passphrase, params)?.to_bytes())?;
        tracing::debug!(path = %path.display(), "Saved sealed identity");
        Ok(())
    }

    /// Read and unseal from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Storage`] if the file cannot be read, and the
    /// errors of [`Identity::unseal`].
    pub fn load(path: impl AsRef<Path>, passphrase: &[u8]) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let blob = SealedBlob::from_bytes(&bytes)?;
        Self::unseal(&blob, passphrase)
    }

    /// Shareable descriptor: base64 JSON `[identityPublicKey, username]`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if encoding fails.
    pub fn export_descriptor(&self) -> Result<String> {
        let record = self.keys.public_key().export_key();
        let json = serde_json::to_vec(&(record, &self.username))?;
        Ok(STANDARD.encode(json))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("id", &self.address.id())
            .finish_non_exhaustive()
    }
}

/// Private persisted form of an [`Identity`]. Wiped on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    /// Display name
    pub username: String,
    /// Base64 PKCS#8 DER of the RSA identity key
    pub identity_key: String,
    /// Base64 P-256 scalar of the messaging key
    pub messaging_key: String,
}

impl fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A peer introduced by its export descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactDescriptor {
    /// Address with the identity key set and the id recomputed
    pub address: Address,
    /// Username the peer chose
    pub username: String,
}

impl ContactDescriptor {
    /// Parse a descriptor produced by [`Identity::export_descriptor`].
    ///
    /// The decoded JSON must be exactly `[<key record object>, <string>]`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedMessage`] for any other shape and
    /// [`ProtocolError::KeyFormat`] if the key does not import.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let json = STANDARD
            .decode(descriptor.trim().as_bytes())
            .map_err(|_| ProtocolError::malformed("descriptor is not base64"))?;
        let value: serde_json::Value = serde_json::from_slice(&json)
            .map_err(|_| ProtocolError::malformed("descriptor is not JSON"))?;

        let [key, username] = value
            .as_array()
            .map(Vec::as_slice)
            .ok_or(ProtocolError::malformed("descriptor is not an array"))?
        else {
            return Err(ProtocolError::malformed(
                "descriptor must have exactly two elements",
            ));
        };
        if !key.is_object() {
            return Err(ProtocolError::malformed("descriptor key is not an object"));
        }
        let username = username
            .as_str()
            .ok_or(ProtocolError::malformed("descriptor username is not a string"))?;
        let record: KeyRecord = serde_json::from_value(key.clone())
            .map_err(|e| ProtocolError::KeyFormat(e.to_string()))?;

        let mut address = Address::empty();
        address.set_identity_record(&record)?;
        Ok(Self {
            address,
            username: username.to_string(),
        })
    }
}
