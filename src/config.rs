//! Wallet configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use bitcoin::Network;

use crate::network::{TARGET_PEERS, USER_AGENT};

/// Configuration for the SPV wallet.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Network to connect to.
    pub network: Network,

    /// BIP39 mnemonic. Generated and persisted when absent.
    pub mnemonic: Option<String>,

    /// Directory for the header store. Headers stay in memory when unset.
    pub data_dir: Option<PathBuf>,

    /// Single peer to use instead of DNS discovery (e.g. a local node).
    pub trusted_peer: Option<SocketAddr>,

    /// Target connection count in discovery mode.
    pub target_peers: usize,

    /// User agent sent in the version message.
    pub user_agent: String,

    /// Absolute fee-per-byte ceiling.
    pub max_fee: u64,

    /// Static satoshi-per-byte rates.
    pub priority_fee: u64,
    pub normal_fee: u64,
    pub economic_fee: u64,

    /// Fee oracle endpoint; static rates apply when unset or unreachable.
    pub fee_oracle_url: Option<String>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            mnemonic: None,
            data_dir: None,
            trusted_peer: None,
            target_peers: TARGET_PEERS,
            user_agent: USER_AGENT.to_string(),
            max_fee: 2000,
            priority_fee: 50,
            normal_fee: 20,
            economic_fee: 5,
            fee_oracle_url: None,
        }
    }
}

impl WalletConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    pub fn with_mnemonic(mut self, mnemonic: impl Into<String>) -> Self {
        self.mnemonic = Some(mnemonic.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_trusted_peer(mut self, peer: SocketAddr) -> Self {
        self.trusted_peer = Some(peer);
        self
    }

    pub fn with_fee_oracle(mut self, url: impl Into<String>) -> Self {
        self.fee_oracle_url = Some(url.into());
        self
    }

    pub fn with_fees(mut self, economic: u64, normal: u64, priority: u64, max: u64) -> Self {
        self.economic_fee = economic;
        self.normal_fee = normal;
        self.priority_fee = priority;
        self.max_fee = max;
        self
    }
}
