//! Record store abstraction: the single persistence seam of the wallet.
//!
//! Implementations may share one connection; the split into sub-tables is
//! for testability, letting each sub-store be replaced by an in-memory
//! map.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::{PrivateKey, Script, ScriptBuf, Txid};

use crate::error::StoreResult;
use crate::types::{KeyPath, KeyPurpose, Stxo, TxRecord, Utxo};

pub use memory::MemoryWalletStore;

/// Derived and imported key records, keyed by script.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Persist a derived key path for the given script.
    async fn put(&self, script: &Script, path: KeyPath) -> StoreResult<()>;

    /// Persist an imported private key at the sentinel path.
    async fn import_key(&self, script: &Script, key: PrivateKey) -> StoreResult<()>;

    /// Flag the key behind this script as used.
    async fn mark_used(&self, script: &Script) -> StoreResult<()>;

    /// Highest stored index for the purpose and whether it is used.
    /// `None` until any key for the purpose exists.
    async fn last_index(&self, purpose: KeyPurpose) -> StoreResult<Option<(i32, bool)>>;

    /// Derivation path for a script. Imported keys report `NotFound`.
    async fn path_for_script(&self, script: &Script) -> StoreResult<KeyPath>;

    /// Imported private key for a script.
    async fn key_for_script(&self, script: &Script) -> StoreResult<PrivateKey>;

    /// Unused indices for a purpose, ascending.
    async fn unused(&self, purpose: KeyPurpose) -> StoreResult<Vec<i32>>;

    /// Every stored key path.
    async fn all(&self) -> StoreResult<Vec<KeyPath>>;

    /// Every stored script with its path.
    async fn all_scripts(&self) -> StoreResult<Vec<(ScriptBuf, KeyPath)>>;

    /// Count of unused keys above the highest used index, per purpose.
    async fn lookahead_windows(&self) -> StoreResult<HashMap<KeyPurpose, u32>>;
}

/// Unspent transaction outputs.
#[async_trait]
pub trait UtxoStore: Send + Sync {
    async fn put(&self, utxo: Utxo) -> StoreResult<()>;
    async fn all(&self) -> StoreResult<Vec<Utxo>>;
    async fn set_watch_only(&self, utxo: &Utxo) -> StoreResult<()>;
    async fn delete(&self, utxo: &Utxo) -> StoreResult<()>;
}

/// Spent transaction outputs.
#[async_trait]
pub trait StxoStore: Send + Sync {
    async fn put(&self, stxo: Stxo) -> StoreResult<()>;
    async fn all(&self) -> StoreResult<Vec<Stxo>>;
    async fn delete(&self, stxo: &Stxo) -> StoreResult<()>;
}

/// Wallet-relevant transactions.
#[async_trait]
pub trait TxnStore: Send + Sync {
    async fn put(&self, record: TxRecord) -> StoreResult<()>;
    async fn get(&self, txid: &Txid) -> StoreResult<TxRecord>;
    async fn all(&self, include_watch_only: bool) -> StoreResult<Vec<TxRecord>>;
    async fn update_height(&self, txid: &Txid, height: i32) -> StoreResult<()>;
    async fn delete(&self, txid: &Txid) -> StoreResult<()>;
}

/// Raw scripts watched on behalf of third parties.
#[async_trait]
pub trait WatchedScriptStore: Send + Sync {
    async fn put(&self, script: ScriptBuf) -> StoreResult<()>;
    async fn all(&self) -> StoreResult<Vec<ScriptBuf>>;
    async fn delete(&self, script: &Script) -> StoreResult<()>;
}

/// Aggregate store handed to the wallet; sub-tables may share a backend.
pub trait WalletStore: Send + Sync {
    fn keys(&self) -> &dyn KeyStore;
    fn utxos(&self) -> &dyn UtxoStore;
    fn stxos(&self) -> &dyn StxoStore;
    fn txns(&self) -> &dyn TxnStore;
    fn watched_scripts(&self) -> &dyn WatchedScriptStore;
}

/// Wallet metadata: the mnemonic and the creation timestamp.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn mnemonic(&self) -> StoreResult<String>;
    async fn set_mnemonic(&self, mnemonic: &str) -> StoreResult<()>;
    async fn creation_date(&self) -> StoreResult<u64>;
    async fn set_creation_date(&self, timestamp: u64) -> StoreResult<()>;
}
