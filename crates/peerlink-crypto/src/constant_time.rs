//! Constant-time comparisons.
//!
//! Challenge echoes, nonce bindings and key fingerprints are compared here so
//! that timing depends only on length, never on content.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Returns `true` if slices are equal, `false` otherwise.
/// Execution time depends only on slice length, not content.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Timing-safe 32-byte array comparison.
#[must_use]
#[inline(never)]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"challenge", b"challenge"));
        assert!(!ct_eq(b"challenge", b"challengf"));
        assert!(!ct_eq(b"short", b"longer"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_verify_32() {
        let a = [0x11u8; 32];
        let mut b = a;
        assert!(verify_32(&a, &b));
        b[31] ^= 1;
        assert!(!verify_32(&a, &b));
    }
}
