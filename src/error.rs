//! Error types for the SPV wallet.

use std::io;

use thiserror::Error;

/// Main error type for the SPV wallet.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Keychain error: {0}")]
    Keychain(#[from] KeychainError),

    #[error("Transaction builder error: {0}")]
    Builder(#[from] BuilderError),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid fee level: {0}")]
    InvalidFeeLevel(String),

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while validating and committing block headers.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The header's parent is not in the store.
    #[error("Header does not extend any known headers")]
    OrphanHeader,

    #[error("Header does not link to its claimed parent")]
    HeaderDidNotExtend,

    #[error("Invalid proof of work")]
    InvalidProofOfWork,

    #[error("Header bits do not match the required difficulty (got {got:#010x}, want {want:#010x})")]
    DifficultyMismatch { got: u32, want: u32 },

    /// The header store has no record for the requested hash.
    #[error("Header not found in store")]
    NotFound,

    #[error("Checkpoint for {0} could not be seeded")]
    CheckpointSeed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Network and peer-to-peer errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Peer does not advertise NODE_BLOOM")]
    MissingBloomService,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Malformed merkle block: {0}")]
    MalformedMerkleBlock(String),

    #[error("Merkle block out of order: got {got}, expected {expected}")]
    MerkleBlockOutOfOrder { got: String, expected: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message encoding error: {0}")]
    Encoding(#[from] bitcoin::consensus::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Record store errors. All persistence failures surface through here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Keychain derivation and lookup errors.
#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("BIP32 derivation failed: {0}")]
    Derivation(#[from] bitcoin::bip32::Error),

    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Unknown key purpose: {0}")]
    UnknownPurpose(String),

    #[error("No key found for script")]
    KeyNotFound,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Coin selection and transaction building errors.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Fee exceeds transaction value")]
    FeeExceedsMax,

    #[error("Cannot bump fee: transaction has confirmed or foreign inputs")]
    UnconfirmedInputsForBump,

    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Keychain error: {0}")]
    Keychain(#[from] KeychainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Type alias for Result with WalletError.
pub type Result<T> = std::result::Result<T, WalletError>;

/// Type alias for chain operation results.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Type alias for network operation results.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for store operation results.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for keychain operation results.
pub type KeychainResult<T> = std::result::Result<T, KeychainError>;

/// Type alias for builder operation results.
pub type BuilderResult<T> = std::result::Result<T, BuilderError>;
