//! Identity (RSA-OAEP) and messaging (ECDH P-256) key pairs.

use crate::error::{CryptoError, Result};
use crate::key_codec::{KeyAlgorithm, KeyCodec, KeyRecord, encode_member};
use crate::session_key::SessionKey;
use crate::{RSA_BLOCK_SIZE, RSA_MODULUS_BITS, RSA_PLAINTEXT_BLOCK_SIZE};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// Public half of an identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPublicKey(RsaPublicKey);

impl IdentityPublicKey {
    /// Big-endian modulus bytes without leading zeros.
    #[must_use]
    pub fn modulus(&self) -> Vec<u8> {
        self.0.n().to_bytes_be()
    }

    /// Base64url (unpadded) encoding of the modulus, as carried in `n`.
    #[must_use]
    pub fn modulus_b64(&self) -> String {
        encode_member(&self.modulus())
    }

    /// RSA-OAEP encrypt a single block of at most 190 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidParameter`] for oversized blocks and
    /// [`CryptoError::EncryptionFailed`] if OAEP encryption fails.
    pub fn encrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        if block.len() > RSA_PLAINTEXT_BLOCK_SIZE {
            return Err(CryptoError::InvalidParameter(format!(
                "RSA-OAEP block of {} bytes exceeds {RSA_PLAINTEXT_BLOCK_SIZE}",
                block.len()
            )));
        }
        self.0
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), block)
            .map_err(|_| CryptoError::EncryptionFailed)
    }
}

impl KeyCodec for IdentityPublicKey {
    const ALGORITHM: KeyAlgorithm = KeyAlgorithm::RsaOaepSha256;

    fn export_key(&self) -> KeyRecord {
        KeyRecord {
            kty: "RSA".into(),
            alg: Some("RSA-OAEP-256".into()),
            n: Some(self.modulus_b64()),
            e: Some(encode_member(&self.0.e().to_bytes_be())),
            crv: None,
            x: None,
            y: None,
            key_ops: vec!["encrypt".into()],
            ext: true,
        }
    }

    fn import_key(record: &KeyRecord) -> Result<Self> {
        record.expect_algorithm(Self::ALGORITHM)?;
        let n = record.decode_member("n", record.n.as_ref())?;
        let e = record.decode_member("e", record.e.as_ref())?;

        let n = BigUint::from_bytes_be(&n);
        if n.bits() != RSA_MODULUS_BITS {
            return Err(CryptoError::KeyFormat(format!(
                "identity key must be {RSA_MODULUS_BITS}-bit, got {}",
                n.bits()
            )));
        }
        let key = RsaPublicKey::new(n, BigUint::from_bytes_be(&e))
            .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
        Ok(Self(key))
    }
}

/// Long-lived RSA-OAEP identity key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    private: RsaPrivateKey,
    public: IdentityPublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh 2048-bit key pair with exponent 65537.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyGeneration`] if prime generation fails.
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_MODULUS_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = IdentityPublicKey(private.to_public_key());
        Self { private, public }
    }

    /// Public half.
    #[must_use]
    pub fn public_key(&self) -> &IdentityPublicKey {
        &self.public
    }

    /// RSA-OAEP decrypt one 256-byte block.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedBlockCiphertext`] for a wrong block
    /// length and [`CryptoError::BlockDecryptionFailed`] if OAEP decoding fails.
    pub fn decrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        if block.len() != RSA_BLOCK_SIZE {
            return Err(CryptoError::MalformedBlockCiphertext(block.len()));
        }
        self.private
            .decrypt(Oaep::new::<Sha256>(), block)
            .map_err(|_| CryptoError::BlockDecryptionFailed)
    }

    /// Encode the private key as PKCS#8 DER.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if encoding fails.
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let document = self
            .private
            .to_pkcs8_der()
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(Zeroizing::new(document.as_bytes().to_vec()))
    }

    /// Decode a PKCS#8 DER private key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the DER is invalid and
    /// [`CryptoError::KeyFormat`] if the key is not 2048-bit.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let private =
            RsaPrivateKey::from_pkcs8_der(der).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        if private.n().bits() != RSA_MODULUS_BITS {
            return Err(CryptoError::KeyFormat(format!(
                "identity key must be {RSA_MODULUS_BITS}-bit"
            )));
        }
        Ok(Self::from_private(private))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modulus = self.public.modulus_b64();
        f.debug_struct("IdentityKeyPair")
            .field("modulus", &&modulus[..16])
            .finish_non_exhaustive()
    }
}

/// Public half of a messaging key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingPublicKey(p256::PublicKey);

impl KeyCodec for MessagingPublicKey {
    const ALGORITHM: KeyAlgorithm = KeyAlgorithm::EcdhP256;

    fn export_key(&self) -> KeyRecord {
        // 0x04 || x || y
        let point = self.0.to_encoded_point(false);
        let bytes = point.as_bytes();
        KeyRecord {
            kty: "EC".into(),
            alg: None,
            n: None,
            e: None,
            crv: Some("P-256".into()),
            x: Some(encode_member(&bytes[1..33])),
            y: Some(encode_member(&bytes[33..65])),
            key_ops: Vec::new(),
            ext: true,
        }
    }

    fn import_key(record: &KeyRecord) -> Result<Self> {
        record.expect_algorithm(Self::ALGORITHM)?;
        let x = record.decode_member("x", record.x.as_ref())?;
        let y = record.decode_member("y", record.y.as_ref())?;
        if x.len() != 32 || y.len() != 32 {
            return Err(CryptoError::KeyFormat("P-256 coordinates must be 32 bytes".into()));
        }

        let mut sec1 = Vec::with_capacity(65);
        sec1.push(0x04);
        sec1.extend_from_slice(&x);
        sec1.extend_from_slice(&y);
        let key = p256::PublicKey::from_sec1_bytes(&sec1)
            .map_err(|_| CryptoError::KeyFormat("point is not on P-256".into()))?;
        Ok(Self(key))
    }
}

/// ECDH P-256 key pair used only to derive session keys.
#[derive(Clone)]
pub struct MessagingKeyPair {
    secret: p256::SecretKey,
    public: MessagingPublicKey,
}

impl MessagingKeyPair {
    /// Generate a fresh key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_secret(p256::SecretKey::random(&mut OsRng))
    }

    fn from_secret(secret: p256::SecretKey) -> Self {
        let public = MessagingPublicKey(secret.public_key());
        Self { secret, public }
    }

    /// Public half.
    #[must_use]
    pub fn public_key(&self) -> &MessagingPublicKey {
        &self.public
    }

    /// Derive the session key shared with `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyAgreement`] if the shared secret cannot be
    /// turned into an AES-256-GCM key.
    pub fn agree(&self, peer: &MessagingPublicKey) -> Result<SessionKey> {
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.0.as_affine());
        SessionKey::from_shared_secret(shared.raw_secret_bytes().as_slice())
    }

    /// Raw 32-byte private scalar.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Restore from a raw private scalar.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the scalar is out of range.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let secret =
            p256::SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(Self::from_secret(secret))
    }
}

impl fmt::Debug for MessagingKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Shared 2048-bit identity for unit tests; RSA generation is slow.
#[cfg(test)]
pub(crate) fn test_identity() -> &'static IdentityKeyPair {
    static IDENTITY: std::sync::OnceLock<IdentityKeyPair> = std::sync::OnceLock::new();
    IDENTITY.get_or_init(|| IdentityKeyPair::generate().unwrap())
}
