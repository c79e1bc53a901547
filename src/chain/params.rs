//! Network parameters and compiled-in checkpoints.
//!
//! Checkpoints are hardcoded headers at known-good heights; the header
//! store is seeded from them on first start and no reorg is allowed to
//! cross below the checkpoint.

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::block::Header as BlockHeader;
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::p2p::Magic;
use bitcoin::Network;

/// Blockchain settings that are Bitcoin specific but not carried by the
/// `bitcoin` crate's params type.
pub const TARGET_TIMESPAN_SECS: u64 = 14 * 24 * 60 * 60;
pub const TARGET_SPACING_SECS: u64 = 10 * 60;
/// 2016
pub const EPOCH_LENGTH: u32 = (TARGET_TIMESPAN_SECS / TARGET_SPACING_SECS) as u32;
pub const MAX_DIFF_ADJUST: u64 = 4;
pub const MIN_RETARGET_TIMESPAN: u64 = TARGET_TIMESPAN_SECS / MAX_DIFF_ADJUST;
pub const MAX_RETARGET_TIMESPAN: u64 = TARGET_TIMESPAN_SECS * MAX_DIFF_ADJUST;

/// DNS seeds for Bitcoin mainnet.
pub const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "seed.bitcoinstats.com",
    "seed.btc.petertodd.org",
];

/// DNS seeds for Bitcoin testnet3.
pub const TESTNET_DNS_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
];

/// A hardcoded known-good header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub header: BlockHeader,
}

/// Consensus and connectivity parameters for one network.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    pub magic: Magic,
    /// Maximum allowed target (difficulty 1).
    pub pow_limit: Target,
    /// Compact encoding of `pow_limit`.
    pub pow_limit_bits: CompactTarget,
    /// Testnet/regtest rule: a block more than 2x target spacing after its
    /// parent may use the minimum difficulty.
    pub reduce_min_difficulty: bool,
    /// BIP44 coin type for this network.
    pub coin_type: u32,
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
}

impl NetworkParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Bitcoin => Self {
                network,
                magic: Magic::from(network),
                pow_limit: Target::MAX_ATTAINABLE_MAINNET,
                pow_limit_bits: CompactTarget::from_consensus(0x1d00ffff),
                reduce_min_difficulty: false,
                coin_type: 0,
                default_port: 8333,
                dns_seeds: MAINNET_DNS_SEEDS,
            },
            Network::Testnet => Self {
                network,
                magic: Magic::from(network),
                pow_limit: Target::MAX_ATTAINABLE_TESTNET,
                pow_limit_bits: CompactTarget::from_consensus(0x1d00ffff),
                reduce_min_difficulty: true,
                coin_type: 1,
                default_port: 18333,
                dns_seeds: TESTNET_DNS_SEEDS,
            },
            _ => Self {
                network,
                magic: Magic::from(network),
                pow_limit: Target::MAX_ATTAINABLE_REGTEST,
                pow_limit_bits: CompactTarget::from_consensus(0x207fffff),
                reduce_min_difficulty: true,
                coin_type: 1,
                default_port: 18444,
                dns_seeds: &[],
            },
        }
    }

    /// The checkpoint the header store is seeded with on first start.
    ///
    /// The table is data driven so deeper anchors can be added per network;
    /// the last entry wins. Until one is added the network genesis header
    /// is the unconditional root of chain state.
    pub fn checkpoint(&self) -> Checkpoint {
        let genesis = genesis_block(self.network).header;
        Checkpoint {
            height: 0,
            header: genesis,
        }
    }

    /// Height below which no reorg is possible.
    pub fn checkpoint_height(&self) -> u32 {
        self.checkpoint().height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_length_is_2016() {
        assert_eq!(EPOCH_LENGTH, 2016);
    }

    #[test]
    fn retarget_timespan_bounds() {
        assert_eq!(MIN_RETARGET_TIMESPAN, TARGET_TIMESPAN_SECS / 4);
        assert_eq!(MAX_RETARGET_TIMESPAN, TARGET_TIMESPAN_SECS * 4);
    }

    #[test]
    fn checkpoint_hash_per_network() {
        let mainnet = NetworkParams::for_network(Network::Bitcoin);
        assert_eq!(
            mainnet.checkpoint().header.block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        let regtest = NetworkParams::for_network(Network::Regtest);
        assert_eq!(
            regtest.checkpoint().header.block_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
        assert_eq!(regtest.checkpoint().height, 0);
    }

    #[test]
    fn reduced_difficulty_flags() {
        assert!(!NetworkParams::for_network(Network::Bitcoin).reduce_min_difficulty);
        assert!(NetworkParams::for_network(Network::Testnet).reduce_min_difficulty);
        assert!(NetworkParams::for_network(Network::Regtest).reduce_min_difficulty);
    }
}
