//! Hashing utilities for herd
//!
//! - BLAKE3 for content digests (snapshot integrity)
//! - Key-to-partition mapping for routing

use blake3::Hasher;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Compute BLAKE3 hash incrementally (for streaming)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a key to its partition
pub fn partition_for(key: &str, num_partitions: u64) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let hash_u64 = u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap());
    hash_u64 % num_partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_hash() {
        let data = b"hello world";
        let hash = blake3_hash(data);
        assert_eq!(hash.len(), 64); // BLAKE3 produces 32 bytes = 64 hex chars
    }

    #[test]
    fn test_streaming_hasher_matches_oneshot() {
        let mut hasher = Blake3Hasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), blake3_hash(b"hello world"));
    }

    #[test]
    fn test_partition_for_deterministic() {
        let key = "test-key";
        assert_eq!(partition_for(key, 16), partition_for(key, 16));
    }

    #[test]
    fn test_partition_for_in_range() {
        for i in 0..100 {
            let p = partition_for(&format!("key-{}", i), 8);
            assert!(p < 8);
        }
    }
}
