//! Bloom filter over collection refs, as carried in DNS-SD TXT records.
//!
//! Bit indices use double hashing of the SHA-256 of
//! `collection_id '\0' ref_name`: `h1 + i * h2 (mod bits)` for `i` in `0..k`.

use sha2::{Digest, Sha256};

use crate::refspec::CollectionRef;

/// Identifier of the string hash function.
pub const HASH_ID_STR: u8 = 1;

/// Fixed-size bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    k: u8,
}

impl BloomFilter {
    /// Empty filter of `size` bytes using `k` hash functions.
    pub fn new(size: usize, k: u8) -> Self {
        Self {
            bits: vec![0; size],
            k,
        }
    }

    /// Filter from received bytes.
    pub fn from_bytes(bits: Vec<u8>, k: u8) -> Self {
        Self { bits, k }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn size(&self) -> usize {
        self.bits.len()
    }

    pub fn add(&mut self, collection_ref: &CollectionRef) {
        for index in self.indices(collection_ref) {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    /// False means definitely absent.
    pub fn may_contain(&self, collection_ref: &CollectionRef) -> bool {
        if self.bits.is_empty() {
            return false;
        }
        self.indices(collection_ref)
            .all(|index| self.bits[index / 8] & (1 << (index % 8)) != 0)
    }

    fn indices(&self, collection_ref: &CollectionRef) -> impl Iterator<Item = usize> {
        let nbits = (self.bits.len() as u64) * 8;
        let digest = Sha256::new()
            .chain_update(collection_ref.collection_id.as_deref().unwrap_or("").as_bytes())
            .chain_update([0u8])
            .chain_update(collection_ref.ref_name.as_bytes())
            .finalize();
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[..8]);
        h2.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_be_bytes(h1);
        let h2 = u64::from_be_bytes(h2) | 1;

        (0..u64::from(self.k)).filter_map(move |i| {
            if nbits == 0 {
                None
            } else {
                Some((h1.wrapping_add(i.wrapping_mul(h2)) % nbits) as usize)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_added_refs_are_contained() {
        let mut bloom = BloomFilter::new(250, 1);
        let refs: Vec<_> = (0..20)
            .map(|i| CollectionRef::new(Some("com.example.Os"), &format!("os/eos/amd64/{}", i)))
            .collect();
        for r in &refs {
            bloom.add(r);
        }
        assert!(refs.iter().all(|r| bloom.may_contain(r)));
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let bloom = BloomFilter::new(250, 3);
        assert!(!bloom.may_contain(&CollectionRef::new(None, "os/eos/amd64/eos3")));
        let zero = BloomFilter::new(0, 1);
        assert!(!zero.may_contain(&CollectionRef::new(None, "os/eos/amd64/eos3")));
    }

    #[test]
    fn test_collection_id_distinguishes_entries() {
        let mut bloom = BloomFilter::new(250, 4);
        bloom.add(&CollectionRef::new(Some("com.example.Os"), "os/eos/amd64/eos3"));
        assert!(!bloom.may_contain(&CollectionRef::new(Some("org.other"), "os/eos/amd64/eos3")));
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let mut bloom = BloomFilter::new(16, 2);
        let r = CollectionRef::new(None, "a");
        bloom.add(&r);
        let copy = BloomFilter::from_bytes(bloom.as_bytes().to_vec(), bloom.k());
        assert!(copy.may_contain(&r));
        assert_eq!(copy, bloom);
    }

    #[test]
    fn test_no_false_negatives_for_random_refs() {
        use rand::distr::{Alphanumeric, SampleString};
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let size = rng.random_range(1..=250);
            let k = rng.random_range(1..=8);
            let mut bloom = BloomFilter::new(size, k);
            let refs: Vec<_> = (0..rng.random_range(1..40))
                .map(|_| {
                    let name = format!("os/{}", Alphanumeric.sample_string(&mut rng, 12));
                    CollectionRef::new(Some("com.example.Os"), &name)
                })
                .collect();
            for r in &refs {
                bloom.add(r);
            }
            assert!(refs.iter().all(|r| bloom.may_contain(r)), "size={} k={}", size, k);
        }
    }
}
