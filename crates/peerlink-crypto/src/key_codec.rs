//! Canonical key records and RSA block chunking.
//!
//! Public keys travel as [`KeyRecord`]s, a JSON-web-key shaped structure whose
//! binary members are base64url without padding. The record for an identity
//! key carries the modulus `n`, which is also the input to address ids, so
//! encoding must be canonical: big-endian, no leading zero bytes.
//!
//! RSA-OAEP can only encrypt [`RSA_PLAINTEXT_BLOCK_SIZE`] bytes at a time.
//! [`encrypt_large`] splits longer buffers into independent blocks:
//!
//! ```text
//! plaintext:  [ 190 ][ 190 ][ 190 ][ 57 ]
//!                |      |      |      |
//! ciphertext: [ 256 ][ 256 ][ 256 ][ 256 ]
//! ```

use crate::error::{CryptoError, Result};
use crate::keys::{IdentityKeyPair, IdentityPublicKey};
use crate::{RSA_BLOCK_SIZE, RSA_PLAINTEXT_BLOCK_SIZE};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

/// Algorithms a [`KeyRecord`] can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA-OAEP with SHA-256, used for identity keys
    RsaOaepSha256,
    /// ECDH over P-256, used for messaging keys
    EcdhP256,
}

impl KeyAlgorithm {
    /// The `kty` member expected in records of this algorithm.
    #[must_use]
    pub fn key_type(self) -> &'static str {
        match self {
            KeyAlgorithm::RsaOaepSha256 => "RSA",
            KeyAlgorithm::EcdhP256 => "EC",
        }
    }
}

/// Transferable representation of a public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Key type (`RSA` or `EC`)
    pub kty: String,
    /// Algorithm name, RSA keys only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// RSA modulus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA public exponent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// Curve name, EC keys only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC affine x coordinate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC affine y coordinate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// Permitted operations
    #[serde(default)]
    pub key_ops: Vec<String>,
    /// Extractable flag
    #[serde(default)]
    pub ext: bool,
}

impl KeyRecord {
    /// Look up a required base64url member and decode it.
    pub(crate) fn decode_member(&self, name: &str, value: Option<&String>) -> Result<Vec<u8>> {
        let encoded =
            value.ok_or_else(|| CryptoError::KeyFormat(format!("missing member `{name}`")))?;
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| CryptoError::KeyFormat(format!("member `{name}`: {e}")))
    }

    /// Check that the record describes a key of `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFormat`] if `kty` or `alg`/`crv` disagree.
    pub fn expect_algorithm(&self, algorithm: KeyAlgorithm) -> Result<()> {
        if self.kty != algorithm.key_type() {
            return Err(CryptoError::KeyFormat(format!(
                "expected key type {}, got {}",
                algorithm.key_type(),
                self.kty
            )));
        }
        match algorithm {
            KeyAlgorithm::RsaOaepSha256 => {
                if let Some(alg) = &self.alg {
                    if alg != "RSA-OAEP-256" {
                        return Err(CryptoError::KeyFormat(format!("unsupported alg {alg}")));
                    }
                }
            }
            KeyAlgorithm::EcdhP256 => {
                if self.crv.as_deref() != Some("P-256") {
                    return Err(CryptoError::KeyFormat("expected curve P-256".into()));
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn encode_member(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Lossless conversion between a public key and its [`KeyRecord`].
pub trait KeyCodec: Sized {
    /// Algorithm this key type is imported with.
    const ALGORITHM: KeyAlgorithm;

    /// Export the key as a record.
    fn export_key(&self) -> KeyRecord;

    /// Import a key from a record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFormat`] if the record is malformed, names a
    /// different algorithm, or does not describe a valid key.
    fn import_key(record: &KeyRecord) -> Result<Self>;
}

/// Encrypt a buffer of any length under an identity public key.
///
/// The buffer is split into 190-byte blocks, each encrypted independently
/// into a 256-byte block. An empty buffer yields an empty ciphertext.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptionFailed`] if a block fails to encrypt.
pub fn encrypt_large(public_key: &IdentityPublicKey, buffer: &[u8]) -> Result<Vec<u8>> {
    let blocks = buffer.len().div_ceil(RSA_PLAINTEXT_BLOCK_SIZE);
    let mut out = Vec::with_capacity(blocks * RSA_BLOCK_SIZE);
    for chunk in buffer.chunks(RSA_PLAINTEXT_BLOCK_SIZE) {
        out.extend_from_slice(&public_key.encrypt_block(chunk)?);
    }
    Ok(out)
}

/// Inverse of [`encrypt_large`].
///
/// # Errors
///
/// Returns [`CryptoError::MalformedBlockCiphertext`] if the ciphertext is not
/// a whole number of blocks and [`CryptoError::BlockDecryptionFailed`] if
/// any block fails OAEP decryption.
pub fn decrypt_large(key_pair: &IdentityKeyPair, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % RSA_BLOCK_SIZE != 0 {
        return Err(CryptoError::MalformedBlockCiphertext(ciphertext.len()));
    }
    let mut out = Vec::with_capacity(ciphertext.len() / RSA_BLOCK_SIZE * RSA_PLAINTEXT_BLOCK_SIZE);
    for block in ciphertext.chunks(RSA_BLOCK_SIZE) {
        out.extend_from_slice(&key_pair.decrypt_block(block)?);
    }
    Ok(out)
}
