//! Stable structural fingerprints.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex digits kept from the digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Hash the canonical JSON encoding of `value`.
///
/// The encoding only depends on field order and values, so fingerprints are
/// stable across processes and can be persisted.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"unserializable".to_vec());
    let digest = Sha256::digest(&bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint(&("mm", [16, 16, 8]));
        let b = fingerprint(&("mm", [16, 16, 8]));
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert_ne!(a, fingerprint(&("mm", [16, 16, 4])));
    }
}
