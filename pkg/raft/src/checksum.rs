//! Keyed 64-bit checksum used by the snapshot codec.
//!
//! The key is derived once per group by hashing the group name with
//! SHA-256 and taking the first 16 bytes as the SipHash key. SipHash is
//! what the sibling `haystack` package already reaches for (`siphasher`)
//! for keyed short-input hashing, so we keep using it here rather than
//! bringing in a second hashing crate.

use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

#[derive(Debug, Clone, Copy)]
pub struct ChecksumKey {
    k0: u64,
    k1: u64,
}

impl ChecksumKey {
    pub fn derive(group: &str) -> Self {
        let digest = Sha256::digest(group.as_bytes());
        let k0 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let k1 = u64::from_le_bytes(digest[8..16].try_into().unwrap());
        ChecksumKey { k0, k1 }
    }

    pub fn checksum(&self, data: &[u8]) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(self.k0, self.k1);
        hasher.write(data);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_group_same_key() {
        let a = ChecksumKey::derive("__cluster__");
        let b = ChecksumKey::derive("__cluster__");
        assert_eq!(a.checksum(b"hello"), b.checksum(b"hello"));
    }

    #[test]
    fn different_group_different_checksum() {
        let a = ChecksumKey::derive("group-a");
        let b = ChecksumKey::derive("group-b");
        assert_ne!(a.checksum(b"hello"), b.checksum(b"hello"));
    }
}
