//! Common type definitions for the SPV wallet.

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

/// Unique identifier for a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer_{}", self.0)
    }
}

/// Purpose of a derived key: receive (external) or change (internal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPurpose {
    External,
    Internal,
}

impl KeyPurpose {
    /// BIP44 chain index for this purpose.
    pub fn chain_index(&self) -> u32 {
        match self {
            KeyPurpose::External => 0,
            KeyPurpose::Internal => 1,
        }
    }
}

impl std::fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPurpose::External => write!(f, "external"),
            KeyPurpose::Internal => write!(f, "internal"),
        }
    }
}

/// Derivation slot of a wallet key. Index -1 marks imported single keys
/// that carry no derivation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPath {
    pub purpose: KeyPurpose,
    pub index: i32,
}

impl KeyPath {
    pub fn new(purpose: KeyPurpose, index: i32) -> Self {
        Self {
            purpose,
            index,
        }
    }

    /// Sentinel path for imported keys.
    pub fn imported() -> Self {
        Self {
            purpose: KeyPurpose::External,
            index: -1,
        }
    }

    pub fn is_imported(&self) -> bool {
        self.index < 0
    }
}

/// An unspent transaction output tracked by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// The outpoint (funding txid + output index).
    pub outpoint: OutPoint,

    /// Output value in satoshis.
    pub value: Amount,

    /// The scriptPubKey locking this output.
    pub script_pubkey: ScriptBuf,

    /// Block height where this output confirmed. 0 means unconfirmed.
    pub height: u32,

    /// True for outputs matched only through a watched script; the wallet
    /// holds no private key for these.
    pub watch_only: bool,

    /// Frozen outputs are excluded from coin selection.
    pub frozen: bool,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, value: Amount, script_pubkey: ScriptBuf, height: u32) -> Self {
        Self {
            outpoint,
            value,
            script_pubkey,
            height,
            watch_only: false,
            frozen: false,
        }
    }
}

/// A spent transaction output: the original UTXO plus the spend that
/// consumed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stxo {
    pub utxo: Utxo,

    /// Height of the spending transaction. 0 means the spend is unconfirmed.
    pub spend_height: u32,

    /// Transaction that consumed this output.
    pub spend_txid: Txid,
}

/// A wallet-relevant transaction as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub txid: Txid,

    /// Net value of the transaction to this wallet, in satoshis.
    pub value: i64,

    /// Confirmation height. 0 = unconfirmed, negative = dead (superseded by
    /// a double spend or reorged away).
    pub height: i32,

    /// Unix timestamp at which the wallet first saw the transaction.
    pub timestamp: u64,

    /// True when the transaction only touches watched scripts.
    pub watch_only: bool,

    /// Raw consensus-encoded transaction bytes.
    pub raw: Vec<u8>,
}

impl TxRecord {
    pub fn is_dead(&self) -> bool {
        self.height < 0
    }

    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// Owned notification payload delivered to transaction subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub txid: Txid,
    pub value: i64,
    pub height: i32,
    pub timestamp: u64,
    pub watch_only: bool,
}

impl From<&TxRecord> for TransactionEvent {
    fn from(rec: &TxRecord) -> Self {
        Self {
            txid: rec.txid,
            value: rec.value,
            height: rec.height,
            timestamp: rec.timestamp,
            watch_only: rec.watch_only,
        }
    }
}

/// Global synchronization state of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSyncState {
    /// Walking headers from the download peer.
    SyncingHeaders,
    /// Headers caught up; requesting filtered blocks.
    SyncingBlocks,
    /// Fully caught up; reacting to inv messages only.
    Waiting,
}

/// Queue entry for a requested filtered block.
///
/// Caching the hash:height pair at request time lets out-of-order
/// merkleblock responses be detected without a disk lookup, and lets
/// transaction ingests be stamped with the height of the block they were
/// requested for rather than the height at arrival time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashAndHeight {
    pub hash: BlockHash,
    pub height: u32,
    /// Marks the last merkleblock of the current request window.
    pub final_block: bool,
}

impl HashAndHeight {
    pub fn new(hash: BlockHash, height: u32) -> Self {
        Self {
            hash,
            height,
            final_block: false,
        }
    }
}

/// Fee estimation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeeLevel {
    Economic,
    Normal,
    Priority,
    /// Replace-by-fee bump level, derived from `Priority`.
    FeeBump,
}

impl std::str::FromStr for FeeLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "economic" => Ok(FeeLevel::Economic),
            "normal" => Ok(FeeLevel::Normal),
            "priority" => Ok(FeeLevel::Priority),
            _ => Err(format!("unknown fee level: {}", s)),
        }
    }
}

/// Information about a connected peer, as reported by `peers()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: std::net::SocketAddr,
    pub connected: bool,
    pub version: Option<u32>,
    pub services: Option<u64>,
    pub user_agent: Option<String>,
    pub best_height: Option<i32>,
    pub download_peer: bool,
}
