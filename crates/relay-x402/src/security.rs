//! Constant-time comparison for bearer tokens and other secrets.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time byte comparison that leaks neither content nor length.
///
/// Both inputs are hashed to fixed-length SHA-256 digests before the
/// `subtle` comparison, so input length differences carry no timing signal.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"token", b"token"));
    }

    #[test]
    fn different_inputs_do_not_match() {
        assert!(!constant_time_eq(b"token", b"other"));
        assert!(!constant_time_eq(b"short", b"much longer input"));
        assert!(!constant_time_eq(b"", b"nonempty"));
    }
}
