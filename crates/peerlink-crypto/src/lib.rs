//! # PeerLink Crypto
//!
//! Cryptographic primitives for the PeerLink negotiation protocol.
//!
//! This crate provides:
//! - RSA-OAEP identity keys and block-chunked encryption for payloads larger
//!   than one RSA block
//! - ECDH P-256 messaging keys and session key agreement
//! - AES-256-GCM packet envelopes with a fresh IV per packet
//! - Canonical key records for moving public keys over the wire
//! - Passphrase sealing of identity records at rest (Argon2id + XChaCha20-Poly1305)
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | Identity | RSA-OAEP 2048, SHA-256 | e = 65537, 190-byte plaintext blocks |
//! | Key Agreement | ECDH P-256 | raw shared x-coordinate is the session key |
//! | Packet AEAD | AES-256-GCM | 96-bit random IV per packet |
//! | Fingerprint | SHA-256 | session key comparison without export |
//! | Sealing | Argon2id + XChaCha20-Poly1305 | identity files |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod constant_time;
pub mod error;
pub mod key_codec;
pub mod keys;
pub mod random;
pub mod sealed;
pub mod session_key;

pub use error::{CryptoError, Result};
pub use key_codec::{KeyAlgorithm, KeyCodec, KeyRecord, decrypt_large, encrypt_large};
pub use keys::{IdentityKeyPair, IdentityPublicKey, MessagingKeyPair, MessagingPublicKey};
pub use sealed::{KeyEncryptionParams, SealedBlob};
pub use session_key::{EncryptedPacket, SessionKey};

/// RSA identity key size in bits
pub const RSA_MODULUS_BITS: usize = 2048;

/// RSA-OAEP ciphertext block size (modulus size in bytes)
pub const RSA_BLOCK_SIZE: usize = RSA_MODULUS_BITS / 8;

/// Largest RSA-OAEP/SHA-256 plaintext block: `k - 2 * hLen - 2`
pub const RSA_PLAINTEXT_BLOCK_SIZE: usize = RSA_BLOCK_SIZE - 2 * 32 - 2;

/// Handshake challenge size (one full plaintext block)
pub const CHALLENGE_SIZE: usize = RSA_PLAINTEXT_BLOCK_SIZE;

/// AES-GCM IV size
pub const IV_SIZE: usize = 12;

/// AES-256-GCM session key size
pub const SESSION_KEY_SIZE: usize = 32;
