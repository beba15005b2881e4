//! AES-256-GCM session keys and packet envelopes.
//!
//! A [`SessionKey`] is created once per successful negotiation and never
//! leaves the process. Its raw bytes are dropped right after the cipher is
//! keyed; only a SHA-256 fingerprint is retained so two ends can be compared.

use crate::constant_time::verify_32;
use crate::error::{CryptoError, Result};
use crate::random::random_iv;
use crate::{IV_SIZE, SESSION_KEY_SIZE};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// Wire envelope for one encrypted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPacket {
    /// Random 96-bit IV
    pub iv: [u8; IV_SIZE],
    /// AES-GCM ciphertext with appended tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedPacket {
    /// Build an envelope from received parts.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNonceLength`] if `iv` is not 12 bytes.
    pub fn from_parts(iv: &[u8], ciphertext: Vec<u8>) -> Result<Self> {
        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| CryptoError::InvalidNonceLength)?;
        Ok(Self { iv, ciphertext })
    }
}

/// Symmetric key bound to one connection.
pub struct SessionKey {
    cipher: Aes256Gcm,
    fingerprint: [u8; 32],
}

impl SessionKey {
    /// Key AES-256-GCM with an ECDH shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyAgreement`] if the secret is not 32 bytes.
    pub fn from_shared_secret(secret: &[u8]) -> Result<Self> {
        if secret.len() != SESSION_KEY_SIZE {
            return Err(CryptoError::KeyAgreement(format!(
                "shared secret is {} bytes, expected {SESSION_KEY_SIZE}",
                secret.len()
            )));
        }
        let secret = Zeroizing::new(secret.to_vec());
        let cipher = Aes256Gcm::new_from_slice(&secret)
            .map_err(|_| CryptoError::KeyAgreement("invalid AES-256 key".into()))?;
        let fingerprint = Sha256::digest(secret.as_slice()).into();
        Ok(Self {
            cipher,
            fingerprint,
        })
    }

    /// SHA-256 of the key bytes.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Whether `other` holds the same key.
    #[must_use]
    pub fn same_key(&self, other: &SessionKey) -> bool {
        verify_32(&self.fingerprint, &other.fingerprint)
    }

    /// Encrypt under a freshly drawn IV.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if no IV can be drawn and
    /// [`CryptoError::EncryptionFailed`] if AES-GCM fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedPacket> {
        let iv = random_iv()?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(EncryptedPacket { iv, ciphertext })
    }

    /// Decrypt and authenticate an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on tag mismatch or truncation.
    pub fn open(&self, packet: &EncryptedPacket) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(&packet.iv), packet.ciphertext.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("fingerprint", &hex::encode(&self.fingerprint[..8]))
            .finish()
    }
}
