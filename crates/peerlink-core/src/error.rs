//! Error types for the PeerLink protocol core.
//!
//! Errors fall into three groups, and callers are expected to react to each
//! differently:
//!
//! - **Security failures** (`IllegitimateKey`, `IllegitimateAddressKey`,
//!   `InvalidNonce`): a cryptographic proof did not hold. Close the
//!   connection and do not retry with the same peer claim; trust may need to
//!   be re-established out of band.
//! - **Timeouts** (`ResponseTimeout`): the peer went quiet. A plain retry
//!   with backoff is reasonable, at the caller's discretion.
//! - **Everything else**: malformed input, decryption failure, local misuse.
//!
//! Nothing in the negotiation path retries internally.
//!
//! # Example
//!
//! ```no_run
//! use peerlink_core::ProtocolError;
//!
//! fn report(err: &ProtocolError) {
//!     if err.is_security_failure() {
//!         eprintln!("peer failed verification: {err}");
//!     } else if err.is_timeout() {
//!         eprintln!("peer unresponsive, try again later: {err}");
//!     }
//! }
//! ```

use peerlink_crypto::CryptoError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by negotiation, channels and the connection manager.
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    // ============ Message Shape Errors ============
    /// A handshake message did not match the shape expected at its stage
    #[error("Malformed handshake message: {0}")]
    MalformedHandshake(Cow<'static, str>),

    /// A negotiation or channel message did not match the expected shape
    #[error("Malformed message: {0}")]
    MalformedMessage(Cow<'static, str>),

    // ============ Security Failures ============
    /// The peer could not prove possession of its claimed identity key
    #[error("Received key is illegitimate")]
    IllegitimateKey,

    /// The claimed identity key does not hash to the transport peer id
    #[error("Illegitimate address key: expected id {expected}, key derives {actual}")]
    IllegitimateAddressKey {
        /// Peer id reported by the signaling layer
        expected: String,
        /// Id derived from the received key
        actual: String,
    },

    /// The nonce bound into the messaging key exchange is not our challenge
    #[error("Invalid nonce in messaging key exchange")]
    InvalidNonce,

    // ============ Timeouts ============
    /// No response arrived within the stage's bound
    #[error("Response timeout while awaiting {stage}")]
    ResponseTimeout {
        /// Stage that was waiting
        stage: &'static str,
    },

    // ============ Cryptographic Errors ============
    /// AEAD authentication failed or ciphertext was malformed
    #[error("Decryption failed: {0}")]
    Decryption(Cow<'static, str>),

    /// Session key derivation failed or was attempted without a peer key
    #[error("Key agreement failed: {0}")]
    KeyAgreement(Cow<'static, str>),

    /// A key record could not be imported
    #[error("Key format error: {0}")]
    KeyFormat(String),

    /// Other cryptographic failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ============ Transport & State ============
    /// Transport reported an error
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// The connection or channel is closed
    #[error("Connection closed")]
    Closed,

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Contact or identity storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encoding or decoding a structured payload failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Returns true if a cryptographic proof about the peer failed.
    #[must_use]
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::IllegitimateKey
                | ProtocolError::IllegitimateAddressKey { .. }
                | ProtocolError::InvalidNonce
        )
    }

    /// Returns true if the peer did not answer in time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::ResponseTimeout { .. })
    }

    /// Returns true if retrying the whole operation later may succeed.
    ///
    /// Only timeouts and transport faults qualify; security failures never do.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::ResponseTimeout { .. } | ProtocolError::Transport(_)
        )
    }

    /// Create a malformed handshake error with static context
    #[must_use]
    pub const fn malformed_handshake(context: &'static str) -> Self {
        ProtocolError::MalformedHandshake(Cow::Borrowed(context))
    }

    /// Create a malformed message error with static context
    #[must_use]
    pub const fn malformed(context: &'static str) -> Self {
        ProtocolError::MalformedMessage(Cow::Borrowed(context))
    }

    /// Create a transport error with static context
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        ProtocolError::Transport(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        ProtocolError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a timeout for the named stage
    #[must_use]
    pub const fn timeout(stage: &'static str) -> Self {
        ProtocolError::ResponseTimeout { stage }
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed
            | CryptoError::BlockDecryptionFailed
            | CryptoError::MalformedBlockCiphertext(_)
            | CryptoError::InvalidNonceLength => ProtocolError::Decryption(err.to_string().into()),
            CryptoError::KeyAgreement(_) => ProtocolError::KeyAgreement(err.to_string().into()),
            CryptoError::KeyFormat(msg) => ProtocolError::KeyFormat(msg),
            other => ProtocolError::Crypto(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
