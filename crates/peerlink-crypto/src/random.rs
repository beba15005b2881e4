//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG.

use crate::CryptoError;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Generate a fresh AES-GCM initialization vector.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_iv() -> Result<[u8; crate::IV_SIZE], CryptoError> {
    let mut iv = [0u8; crate::IV_SIZE];
    fill_random(&mut iv)?;
    Ok(iv)
}

/// Generate a handshake challenge filling exactly one RSA-OAEP plaintext block.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_challenge() -> Result<Vec<u8>, CryptoError> {
    let mut challenge = vec![0u8; crate::CHALLENGE_SIZE];
    fill_random(&mut challenge)?;
    Ok(challenge)
}

/// Generate a random `u32`.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_u32() -> Result<u32, CryptoError> {
    let mut buf = [0u8; 4];
    fill_random(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
