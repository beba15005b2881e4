//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD or RSA encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// RSA-OAEP block could not be decrypted with the local private key
    #[error("RSA-OAEP block decryption failed")]
    BlockDecryptionFailed,

    /// Ciphertext does not split into whole RSA blocks
    #[error("malformed block ciphertext: length {0} is not a multiple of {block}", block = crate::RSA_BLOCK_SIZE)]
    MalformedBlockCiphertext(usize),

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid nonce (IV) length
    #[error("invalid nonce length")]
    InvalidNonceLength,

    /// Key record is malformed or names the wrong algorithm
    #[error("key format error: {0}")]
    KeyFormat(String),

    /// ECDH key agreement failed
    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Passphrase key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
