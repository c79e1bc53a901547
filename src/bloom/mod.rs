//! BIP37 bloom filter construction.

pub mod filter;
pub mod hash;

pub use filter::{BloomFilter, MAX_BLOOM_FILTER_SIZE, MAX_HASH_FUNCS};
pub use hash::murmur3;
