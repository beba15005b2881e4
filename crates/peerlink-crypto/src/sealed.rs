//! Passphrase sealing for identity records at rest.
//!
//! A sealed blob is the identity record encrypted with XChaCha20-Poly1305
//! under a key stretched from the passphrase with Argon2id.
//!
//! ```text
//! +---------+-------------+-----------+------------+---------------------+
//! | magic 4 | version 1   | params 6  | salt 32    | nonce 24 | ct + tag |
//! +---------+-------------+-----------+------------+---------------------+
//! ```

use crate::error::{CryptoError, Result};
use crate::random::fill_random;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const MAGIC: &[u8; 4] = b"PLK\x00";
const FORMAT_VERSION: u8 = 1;
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = MAGIC.len() + 1 + 6 + SALT_SIZE + NONCE_SIZE;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEncryptionParams {
    /// Memory cost in KiB
    pub memory_cost_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KeyEncryptionParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: 65536, // 64 MiB
            iterations: 4,
            parallelism: 4,
        }
    }
}

impl KeyEncryptionParams {
    /// Cheap parameters for tests and throwaway identities.
    #[must_use]
    pub fn low_security() -> Self {
        Self {
            memory_cost_kib: 4096,
            iterations: 2,
            parallelism: 1,
        }
    }

    /// Check the parameters against Argon2 limits and the on-disk encoding.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidParameter`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.memory_cost_kib < 8 || self.memory_cost_kib >= 1 << 24 {
            return Err(CryptoError::InvalidParameter(
                "memory_cost_kib must be in 8..16777216".into(),
            ));
        }
        if self.iterations == 0 || self.iterations > u32::from(u16::MAX) {
            return Err(CryptoError::InvalidParameter(
                "iterations must be in 1..=65535".into(),
            ));
        }
        if self.parallelism == 0 || self.parallelism > 255 {
            return Err(CryptoError::InvalidParameter(
                "parallelism must be in 1..=255".into(),
            ));
        }
        Ok(())
    }

    fn encode(self) -> [u8; 6] {
        let mut bytes = [0u8; 6];
        bytes[0..3].copy_from_slice(&self.memory_cost_kib.to_le_bytes()[0..3]);
        bytes[3..5].copy_from_slice(&(self.iterations as u16).to_le_bytes());
        bytes[5] = self.parallelism as u8;
        bytes
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            memory_cost_kib: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            iterations: u32::from(u16::from_le_bytes([bytes[3], bytes[4]])),
            parallelism: u32::from(bytes[5]),
        }
    }

    fn derive_key(&self, passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        self.validate()?;
        let params = Params::new(self.memory_cost_kib, self.iterations, self.parallelism, Some(32))
            .map_err(|e| CryptoError::InvalidParameter(format!("Argon2 params: {e}")))?;
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase, salt, &mut key[..])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(key)
    }
}

/// Passphrase-encrypted blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    params: KeyEncryptionParams,
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl SealedBlob {
    /// Seal `plaintext` under `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid parameters, RNG failure or AEAD failure.
    pub fn seal(plaintext: &[u8], passphrase: &[u8], params: KeyEncryptionParams) -> Result<Self> {
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        fill_random(&mut salt)?;
        fill_random(&mut nonce)?;

        let key = params.derive_key(passphrase, &salt)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(Self {
            params,
            salt,
            nonce,
            ciphertext,
        })
    }

    /// Recover the plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] for a wrong passphrase or a
    /// tampered blob.
    pub fn open(&self, passphrase: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.params.derive_key(passphrase, &self.salt)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        cipher
            .decrypt(XNonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Re-seal under a new passphrase, optionally with new parameters.
    ///
    /// # Errors
    ///
    /// Fails if `old` does not open the blob.
    pub fn reseal(
        &self,
        old: &[u8],
        new: &[u8],
        params: Option<KeyEncryptionParams>,
    ) -> Result<Self> {
        let plaintext = self.open(old)?;
        Self::seal(&plaintext, new, params.unwrap_or(self.params))
    }

    /// Argon2 parameters used for this blob.
    #[must_use]
    pub fn params(&self) -> &KeyEncryptionParams {
        &self.params
    }

    /// Serialize for storage.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.params.encode());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse a stored blob.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] for truncated or foreign
    /// data and [`CryptoError::InvalidParameter`] for an unknown version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + TAG_SIZE || &bytes[..MAGIC.len()] != MAGIC {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        let version = bytes[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(CryptoError::InvalidParameter(format!(
                "unsupported sealed format version: {version}"
            )));
        }

        let (header, ciphertext) = bytes.split_at(HEADER_SIZE);
        let params = KeyEncryptionParams::decode(&header[5..11]);
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&header[11..11 + SALT_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&header[11 + SALT_SIZE..]);

        Ok(Self {
            params,
            salt,
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KeyEncryptionParams {
        KeyEncryptionParams::low_security()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let record = br#"{"username":"alice","identity":"..."}"#;
        let sealed = SealedBlob::seal(record, b"correct-horse", params()).unwrap();
        assert_eq!(sealed.open(b"correct-horse").unwrap().as_slice(), record);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = SealedBlob::seal(b"secret", b"right", params()).unwrap();
        assert!(matches!(
            sealed.open(b"wrong"),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let sealed = SealedBlob::seal(&[0xAB; 1500], b"pass", params()).unwrap();
        let parsed = SealedBlob::from_bytes(&sealed.to_bytes()).unwrap();
        assert_eq!(parsed, sealed);
        assert_eq!(parsed.params(), &params());
        assert_eq!(parsed.open(b"pass").unwrap().as_slice(), &[0xAB; 1500][..]);
    }

    #[test]
    fn test_tampered_blob_fails() {
        let sealed = SealedBlob::seal(b"secret", b"pass", params()).unwrap();
        let mut bytes = sealed.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let parsed = SealedBlob::from_bytes(&bytes).unwrap();
        assert!(parsed.open(b"pass").is_err());
    }

    #[test]
    fn test_rejects_foreign_and_truncated_data() {
        let bytes = SealedBlob::seal(b"secret", b"pass", params())
            .unwrap()
            .to_bytes();
        assert!(SealedBlob::from_bytes(&bytes[..HEADER_SIZE]).is_err());

        let mut foreign = bytes.clone();
        foreign[0] = b'X';
        assert!(matches!(
            SealedBlob::from_bytes(&foreign),
            Err(CryptoError::InvalidKeyMaterial)
        ));

        let mut versioned = bytes;
        versioned[4] = 9;
        assert!(matches!(
            SealedBlob::from_bytes(&versioned),
            Err(CryptoError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_reseal() {
        let sealed = SealedBlob::seal(b"secret", b"old", params()).unwrap();
        let resealed = sealed.reseal(b"old", b"new", None).unwrap();
        assert!(resealed.open(b"old").is_err());
        assert_eq!(resealed.open(b"new").unwrap().as_slice(), b"secret");
    }

    #[test]
    fn test_invalid_params_rejected() {
        let bad = KeyEncryptionParams {
            memory_cost_kib: 4,
            iterations: 1,
            parallelism: 1,
        };
        assert!(SealedBlob::seal(b"x", b"p", bad).is_err());

        let bad = KeyEncryptionParams {
            parallelism: 0,
            ..params()
        };
        assert!(bad.validate().is_err());
    }
}
