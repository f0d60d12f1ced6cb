//! Asset digests for install logging

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of `data` and return hex string
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Short form of a digest for log lines
pub fn short_hash(data: &[u8]) -> String {
    let hash = compute_hash(data);
    hash[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_known_value() {
        assert_eq!(
            compute_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_short_hash_length() {
        assert_eq!(short_hash(b"").len(), 16);
    }
}
