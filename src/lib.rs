//! Bitcoin SPV wallet library.
//!
//! A Simplified Payment Verification wallet:
//!
//! - Maintains a BIP32/BIP44 hierarchical-deterministic keychain with a
//!   gap-limit lookahead window
//! - Validates a chain of block headers (proof of work, difficulty
//!   retargets, reorg detection and rollback)
//! - Discovers wallet transactions through BIP37 bloom-filtered peers
//! - Builds, signs and replaces transactions under a standard coin
//!   selection and fee policy
//!
//! # Quick Start
//!
//! ```no_run
//! use spv_wallet::{SpvWallet, WalletConfig};
//! use spv_wallet::store::MemoryWalletStore;
//! use bitcoin::Network;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WalletConfig::new(Network::Bitcoin);
//!     let wallet = SpvWallet::new(config, Arc::new(MemoryWalletStore::new())).await?;
//!     wallet.start();
//!     // ... drive it through the public operations ...
//!     wallet.close()?;
//!     Ok(())
//! }
//! ```

pub mod bloom;
pub mod chain;
pub mod config;
pub mod error;
pub mod fees;
pub mod keys;
pub mod logging;
pub mod network;
pub mod store;
pub mod txstore;
pub mod types;
pub mod wallet;

// Re-export the main types for convenience.
pub use config::WalletConfig;
pub use error::{
    BuilderError, ChainError, KeychainError, NetworkError, Result, StoreError, WalletError,
};
pub use fees::FeeProvider;
pub use keys::{KeyManager, LOOKAHEAD_WINDOW};
pub use txstore::TxStore;
pub use types::{FeeLevel, KeyPath, KeyPurpose, Stxo, TransactionEvent, TxRecord, Utxo};
pub use wallet::{Coin, MultisigSignature, SpvWallet};

// Re-export commonly used bitcoin types.
pub use bitcoin::{Address, Amount, BlockHash, Network, OutPoint, ScriptBuf, Txid};

/// Current version of the spv-wallet library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
