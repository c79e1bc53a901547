//! Peer-to-peer networking: connections, handshake, sync and discovery.

pub mod discovery;
pub mod manager;
pub mod peer;
pub mod sync;

use bitcoin::hashes::Hash;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::BlockHash;
use std::time::Duration;

pub use manager::{PeerManager, PeerManagerConfig, PeerRegistry};
pub use peer::{Dialer, Peer, TcpDialer};
pub use sync::SyncController;

/// Protocol version spoken by the wallet.
pub const PROTOCOL_VERSION: u32 = 70012;

/// User agent advertised in the version message.
pub const USER_AGENT: &str = "/spv-wallet:0.1.0/";

/// Bloom-filter false positives tolerated from one peer before the filter
/// is rebuilt and resent to it. BIP37 false-positive rates rise with
/// filter use, so this resets the noise floor.
pub const FP_THRESHOLD: u32 = 7;

/// Capacity of the in-order filtered-block request queue.
pub const BLOCK_QUEUE_CAPACITY: usize = 32;

/// Target number of peer connections without a trusted peer.
pub const TARGET_PEERS: usize = 10;

/// Per-message read timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// A peer silent for this long is dropped.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

/// Connection establishment timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake must complete within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// BIP37 `MSG_FILTERED_BLOCK` inventory type. The `bitcoin` crate does not
/// carry a variant for it, so requests go out through `Inventory::Unknown`.
pub const INV_TYPE_FILTERED_BLOCK: u32 = 3;

/// Inventory entry requesting a merkle-filtered block.
pub fn filtered_block_inv(hash: BlockHash) -> Inventory {
    Inventory::Unknown {
        inv_type: INV_TYPE_FILTERED_BLOCK,
        hash: hash.to_byte_array(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::serialize;

    #[test]
    fn filtered_block_inv_wire_format() {
        let hash = BlockHash::from_byte_array([0xab; 32]);
        let inv = filtered_block_inv(hash);
        let bytes = serialize(&inv);
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..], &[0xab; 32]);
    }
}
