//! BIP37 bloom filter.

use std::cmp;

use bitvec::prelude::*;

use bitcoin::consensus::encode::serialize;
use bitcoin::p2p::message_bloom::{BloomFlags, FilterLoad};
use bitcoin::OutPoint;

use super::hash::murmur3;

/// Maximum size of a bloom filter in bytes (36KB).
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Bloom filter as specified in BIP37.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    filter: BitVec<u8, Lsb0>,
    n_hash_funcs: u32,
    n_tweak: u32,
    flags: BloomFlags,
}

impl BloomFilter {
    /// Create a filter sized for `elements` entries at the given false
    /// positive rate.
    pub fn new(elements: u32, false_positive_rate: f64, tweak: u32, flags: BloomFlags) -> Self {
        let elements = cmp::max(1, elements);
        let rate = false_positive_rate.clamp(1e-9, 0.99);

        let ln2 = std::f64::consts::LN_2;
        let ln2_squared = ln2 * ln2;

        let filter_size = (-1.0 * elements as f64 * rate.ln() / ln2_squared).ceil() as usize;
        let filter_size = cmp::max(1, cmp::min(filter_size, MAX_BLOOM_FILTER_SIZE * 8));

        let n_hash_funcs = (filter_size as f64 / elements as f64 * ln2).ceil() as u32;
        let n_hash_funcs = cmp::max(1, cmp::min(n_hash_funcs, MAX_HASH_FUNCS));

        BloomFilter {
            filter: bitvec![u8, Lsb0; 0; filter_size],
            n_hash_funcs,
            n_tweak: tweak,
            flags,
        }
    }

    fn bit_index(&self, data: &[u8], hash_num: u32) -> usize {
        let seed = hash_num.wrapping_mul(0xfba4c795).wrapping_add(self.n_tweak);
        murmur3(data, seed) as usize % self.filter.len()
    }

    /// Insert raw data into the filter.
    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.n_hash_funcs {
            let index = self.bit_index(data, i);
            self.filter.set(index, true);
        }
    }

    /// Insert the consensus serialization of an outpoint.
    pub fn insert_outpoint(&mut self, outpoint: &OutPoint) {
        self.insert(&serialize(outpoint));
    }

    /// Whether data might be in the filter.
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.filter.is_empty() {
            return true;
        }
        for i in 0..self.n_hash_funcs {
            if !self.filter[self.bit_index(data, i)] {
                return false;
            }
        }
        true
    }

    pub fn contains_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.contains(&serialize(outpoint))
    }

    /// Filter contents as raw bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.filter.as_raw_slice().to_vec()
    }

    pub fn hash_funcs(&self) -> u32 {
        self.n_hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.n_tweak
    }

    pub fn flags(&self) -> BloomFlags {
        self.flags
    }

    /// Wire message pushing this filter to a peer.
    pub fn to_filter_load(&self) -> FilterLoad {
        FilterLoad {
            filter: self.to_bytes(),
            hash_funcs: self.n_hash_funcs,
            tweak: self.n_tweak,
            flags: self.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    #[test]
    fn matches_inserted_address_hashes() {
        // The hash160 payloads the matcher extracts from P2PKH and P2SH
        // outputs are what gets pushed, never whole scriptPubKeys.
        let receive = hex::decode("8f83a59ebdf80b8cc965a28da3a825c126a4cefb").unwrap();
        let change = hex::decode("0706d0505002aa3ef07a822b9c143b0047b07bdf").unwrap();
        let watched = hex::decode("46cc55cee35873e0ebe0a90f66f942919b84d63e").unwrap();

        let mut filter = BloomFilter::new(3, 0.001, 0, BloomFlags::All);
        filter.insert(&receive);
        filter.insert(&watched);
        assert!(filter.contains(&receive));
        assert!(filter.contains(&watched));
        assert!(!filter.contains(&change));

        // A key newly minted by the lookahead joins on the next rebuild.
        filter.insert(&change);
        assert!(filter.contains(&change));
    }

    #[test]
    fn outpoint_round_trip() {
        let mut filter = BloomFilter::new(10, 0.0001, 0, BloomFlags::All);
        let op = OutPoint {
            txid: Txid::from_byte_array([9; 32]),
            vout: 1,
        };
        filter.insert_outpoint(&op);
        assert!(filter.contains_outpoint(&op));
        let other = OutPoint {
            txid: Txid::from_byte_array([9; 32]),
            vout: 2,
        };
        assert!(!filter.contains_outpoint(&other));
    }

    #[test]
    fn wallet_rate_filter_rejects_foreign_outpoints() {
        // Sized like a small wallet's element set at the rate pushed to
        // peers; outpoints the wallet never owned must essentially never
        // match.
        let mut filter = BloomFilter::new(40, 1e-6, 0, BloomFlags::All);
        let own: Vec<OutPoint> = (0u8..40)
            .map(|i| OutPoint {
                txid: Txid::from_byte_array([i; 32]),
                vout: (i % 3) as u32,
            })
            .collect();
        for outpoint in &own {
            filter.insert_outpoint(outpoint);
        }
        for outpoint in &own {
            assert!(filter.contains_outpoint(outpoint));
        }

        let foreign_hits = (40u8..=255)
            .filter(|i| {
                filter.contains_outpoint(&OutPoint {
                    txid: Txid::from_byte_array([*i; 32]),
                    vout: 0,
                })
            })
            .count();
        assert!(foreign_hits < 3, "{} foreign outpoints matched", foreign_hits);
    }

    #[test]
    fn filter_load_carries_parameters() {
        let mut filter = BloomFilter::new(10, 0.001, 12345, BloomFlags::All);
        filter.insert(b"x");
        let load = filter.to_filter_load();
        assert_eq!(load.hash_funcs, filter.hash_funcs());
        assert_eq!(load.tweak, 12345);
        assert_eq!(load.flags, BloomFlags::All);
        assert_eq!(load.filter, filter.to_bytes());
        assert!(load.filter.len() <= MAX_BLOOM_FILTER_SIZE);
    }
}
