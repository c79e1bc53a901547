//! Chain synchronization control.
//!
//! One controller drives the global sync state machine: walk headers on
//! the download peer, stream filtered blocks in request order through a
//! bounded queue, stamp matched transactions with the height they were
//! requested at, and fall back to inv-driven operation once caught up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::deserialize;
use bitcoin::merkle_tree::MerkleBlock;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::{GetHeadersMessage, Inventory};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Transaction, Txid};
use tokio::sync::mpsc;

use crate::chain::Blockchain;
use crate::error::{NetworkError, NetworkResult};
use crate::network::manager::PeerRegistry;
use crate::network::peer::Peer;
use crate::network::{filtered_block_inv, BLOCK_QUEUE_CAPACITY, FP_THRESHOLD};
use crate::txstore::{merkle_block_txids, TxStore};
use crate::types::{ChainSyncState, HashAndHeight};

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Drives header and block sync and dispatches peer messages.
pub struct SyncController {
    chain: Arc<Blockchain>,
    txstore: Arc<TxStore>,
    registry: Arc<PeerRegistry>,
    state: std::sync::Mutex<ChainSyncState>,
    /// Height up to which wallet transactions have been requested.
    sync_height: AtomicU32,
    /// Txids matched by a merkle block, stamped with its height, awaiting
    /// their `tx` messages.
    to_download: std::sync::Mutex<HashMap<Txid, u32>>,
    /// In-order filtered-block request queue. Dropping the receiver aborts
    /// the window: the producer task stops at its next send.
    block_queue: std::sync::Mutex<Option<mpsc::Receiver<HashAndHeight>>>,
}

impl SyncController {
    pub fn new(
        chain: Arc<Blockchain>,
        txstore: Arc<TxStore>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            chain,
            txstore,
            registry,
            state: std::sync::Mutex::new(ChainSyncState::SyncingHeaders),
            sync_height: AtomicU32::new(0),
            to_download: std::sync::Mutex::new(HashMap::new()),
            block_queue: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChainSyncState {
        *self.state.lock().expect("sync state mutex")
    }

    fn set_state(&self, state: ChainSyncState) {
        *self.state.lock().expect("sync state mutex") = state;
    }

    pub fn sync_height(&self) -> u32 {
        self.sync_height.load(Ordering::SeqCst)
    }

    pub fn set_sync_height(&self, height: u32) {
        self.sync_height.store(height, Ordering::SeqCst);
    }

    /// Send `getheaders` with our locator to the download peer.
    pub async fn ask_for_headers(&self, peer: &Arc<Peer>) -> NetworkResult<()> {
        self.set_state(ChainSyncState::SyncingHeaders);
        let locator = self.chain.block_locator();
        tracing::debug!(peer = %peer.id(), hashes = locator.len(), "Sending getheaders");
        peer.send(NetworkMessage::GetHeaders(GetHeadersMessage::new(
            locator,
            BlockHash::all_zeros(),
        )))
        .await
    }

    /// Request filtered blocks for every height between the wallet's sync
    /// height and the header tip, in order. With nothing to request the
    /// chain enters the waiting state and unconfirmed transactions are
    /// rebroadcast.
    pub async fn ask_for_blocks(self: &Arc<Self>, peer: &Arc<Peer>) -> NetworkResult<()> {
        let header_tip = self
            .chain
            .height()
            .map_err(|e| NetworkError::Protocol(format!("header tip unavailable: {}", e)))?;
        let wallet_tip = self.sync_height();
        tracing::debug!(wallet_tip, header_tip, "Block request window");

        if wallet_tip > header_tip {
            return Err(NetworkError::Protocol(
                "wallet tip above header tip, resync required".into(),
            ));
        }
        if wallet_tip == header_tip {
            if self.state() != ChainSyncState::Waiting {
                tracing::info!(height = header_tip, "Blockchain fully synced");
            }
            self.set_state(ChainSyncState::Waiting);
            self.rebroadcast().await;
            return Ok(());
        }

        self.set_state(ChainSyncState::SyncingBlocks);
        let hashes = self.chain.n_prev_hashes((header_tip - wallet_tip) as usize);

        let (sender, receiver) = mpsc::channel::<HashAndHeight>(BLOCK_QUEUE_CAPACITY);
        *self.block_queue.lock().expect("block queue mutex") = Some(receiver);

        let peer = peer.clone();
        tokio::spawn(async move {
            let mut height = wallet_tip;
            for hash in hashes.into_iter().rev() {
                height += 1;
                let mut entry = HashAndHeight::new(hash, height);
                entry.final_block = height == header_tip;

                // Waits here most of the time for the queue to empty out.
                if sender.send(entry).await.is_err() {
                    tracing::debug!("Block window aborted at height {}", height);
                    return;
                }
                let getdata = NetworkMessage::GetData(vec![filtered_block_inv(hash)]);
                if let Err(e) = peer.send(getdata).await {
                    tracing::debug!(peer = %peer.id(), "Block request failed: {}", e);
                    return;
                }
            }
        });
        Ok(())
    }

    /// Advertise unconfirmed transactions and unconfirmed spends to every
    /// connected peer.
    async fn rebroadcast(&self) {
        let pending = self.txstore.pending_inv().await;
        if pending.is_empty() {
            return;
        }
        let inv: Vec<Inventory> =
            pending.iter().map(|txid| Inventory::Transaction(*txid)).collect();
        for peer in self.registry.connected_peers() {
            if let Err(e) = peer.send(NetworkMessage::Inv(inv.clone())).await {
                tracing::debug!(peer = %peer.id(), "Rebroadcast failed: {}", e);
            }
        }
        tracing::debug!(count = pending.len(), "Rebroadcast unconfirmed inventory");
    }

    /// Dispatch one message from a connected peer. An error return drops
    /// the peer.
    pub async fn handle_message(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: NetworkMessage,
    ) -> NetworkResult<()> {
        match message {
            NetworkMessage::Ping(nonce) => peer.send(NetworkMessage::Pong(nonce)).await,
            NetworkMessage::Pong(_) => Ok(()),
            NetworkMessage::Headers(headers) => self.on_headers(peer, headers).await,
            NetworkMessage::MerkleBlock(mb) => self.on_merkle_block(peer, mb).await,
            NetworkMessage::Tx(tx) => self.on_tx(peer, tx).await,
            NetworkMessage::Inv(inv) => self.on_inv(peer, inv).await,
            NetworkMessage::GetData(inv) => self.on_getdata(peer, inv).await,
            NetworkMessage::Version(_) | NetworkMessage::Verack => Ok(()),
            other => {
                tracing::trace!(peer = %peer.id(), cmd = %other.cmd(), "Ignoring message");
                Ok(())
            }
        }
    }

    /// Commit a batch of headers from the download peer. A batch of zero
    /// headers means the peer has nothing more: move on to blocks.
    async fn on_headers(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        headers: Vec<BlockHeader>,
    ) -> NetworkResult<()> {
        if !self.registry.is_download_peer(peer.id()) {
            tracing::debug!(peer = %peer.id(), "Ignoring headers from non-download peer");
            return Ok(());
        }
        if headers.is_empty() {
            tracing::debug!(peer = %peer.id(), "Received 0 headers, probably synced");
            if self.state() == ChainSyncState::SyncingHeaders {
                tracing::info!("Headers fully synced");
            }
            return self.ask_for_blocks(peer).await;
        }

        tracing::debug!(peer = %peer.id(), count = headers.len(), "Validating headers");
        for header in &headers {
            let result = self.chain.commit_header(header).map_err(|e| {
                // A peer feeding headers that do not fit the chain gets
                // disconnected.
                NetworkError::Protocol(format!("header did not fit: {}", e))
            })?;
            if let Some(reorg) = result.reorg {
                self.txstore
                    .process_reorg(reorg.fork_height)
                    .await
                    .map_err(|e| NetworkError::Protocol(format!("reorg rollback: {}", e)))?;
                let rolled_back = self.sync_height().min(reorg.fork_height);
                self.set_sync_height(rolled_back);
            }
        }
        if let Ok(height) = self.chain.height() {
            tracing::debug!("Headers to height {} OK", height);
        }
        self.ask_for_headers(peer).await
    }

    /// A filtered block arrived. During a block walk it must match the
    /// head of the request queue; while waiting it carries its own header
    /// (the inv-announced new-block path).
    async fn on_merkle_block(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        mb: MerkleBlock,
    ) -> NetworkResult<()> {
        let txids = merkle_block_txids(&mb)?;

        if self.state() == ChainSyncState::Waiting {
            return self.ingest_block_and_header(peer, mb, txids).await;
        }

        let entry = {
            let mut queue = self.block_queue.lock().expect("block queue mutex");
            match queue.as_mut().map(|rx| rx.try_recv()) {
                Some(Ok(entry)) => entry,
                // Nothing outstanding: unrequested merkle block.
                _ => {
                    tracing::warn!(peer = %peer.id(), "Unrequested merkle block");
                    return Ok(());
                }
            }
        };

        let block_hash = mb.header.block_hash();
        if entry.hash != block_hash {
            // Dropping the queue aborts the whole window so the wallet
            // sync height cannot advance past the gap.
            *self.block_queue.lock().expect("block queue mutex") = None;
            return Err(NetworkError::MerkleBlockOutOfOrder {
                got: block_hash.to_string(),
                expected: entry.hash.to_string(),
            });
        }

        {
            let mut to_download = self.to_download.lock().expect("download map mutex");
            for txid in txids {
                to_download.insert(txid, entry.height);
            }
        }

        // Record the height as synced. Not quite true until the txs
        // arrive, but problems there surface on the next walk.
        self.set_sync_height(entry.height);

        if entry.final_block {
            // Ask for headers again rather than entering the wait state
            // directly; only a 0-header response followed by an empty
            // block window proves the wallet is caught up.
            self.ask_for_headers(peer).await?;
        }
        tracing::debug!(hash = %block_hash, height = entry.height, "Ingested merkle block");
        Ok(())
    }

    /// New-block path while caught up: commit the header, then stamp the
    /// matched txids with the new height.
    async fn ingest_block_and_header(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        mb: MerkleBlock,
        txids: Vec<Txid>,
    ) -> NetworkResult<()> {
        let result = match self.chain.commit_header(&mb.header) {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(peer = %peer.id(), "Announced block header rejected: {}", e);
                return Ok(());
            }
        };

        let height = if result.new_tip {
            if let Some(reorg) = result.reorg {
                self.txstore
                    .process_reorg(reorg.fork_height)
                    .await
                    .map_err(|e| NetworkError::Protocol(format!("reorg rollback: {}", e)))?;
            }
            self.set_sync_height(result.height);
            result.height
        } else {
            // A block that did not advance the tip only matters if it is
            // the tip we already know.
            let best = self
                .chain
                .best_header()
                .map_err(|e| NetworkError::Protocol(format!("chain tip unavailable: {}", e)))?;
            if best.block_hash() != mb.header.block_hash() {
                return Ok(());
            }
            best.height
        };

        let mut to_download = self.to_download.lock().expect("download map mutex");
        for txid in txids {
            to_download.insert(txid, height);
        }
        tracing::debug!(hash = %mb.header.block_hash(), height, "Ingested announced block");
        Ok(())
    }

    /// A transaction arrived; ingest it at the height its merkle block was
    /// requested for, or at zero if it came straight from an inv.
    async fn on_tx(self: &Arc<Self>, peer: &Arc<Peer>, tx: Transaction) -> NetworkResult<()> {
        let txid = tx.compute_txid();
        let stamped =
            self.to_download.lock().expect("download map mutex").remove(&txid);
        let height = stamped.unwrap_or(0);

        let hits = self
            .txstore
            .ingest(&tx, height, unix_now())
            .await
            .map_err(|e| NetworkError::Protocol(format!("ingest: {}", e)))?;
        tracing::debug!(%txid, height, hits, "Transaction ingested");

        // A matched leaf that produces no hits is a bloom false positive.
        if stamped.is_some() && hits == 0 {
            let count = peer.record_false_positive();
            if count > FP_THRESHOLD {
                tracing::debug!(peer = %peer.id(), count, "Refreshing bloom filter after false positives");
                let filter = self.txstore.bloom_filter().await;
                peer.send(NetworkMessage::FilterLoad(filter.to_filter_load())).await?;
                peer.reset_false_positives();
            }
        }
        Ok(())
    }

    /// Inventory announcements: fetch transactions directly; fetch new
    /// blocks as filtered blocks only when caught up.
    async fn on_inv(self: &Arc<Self>, peer: &Arc<Peer>, inv: Vec<Inventory>) -> NetworkResult<()> {
        for item in inv {
            match item {
                Inventory::Transaction(txid) => {
                    tracing::debug!(peer = %peer.id(), %txid, "Transaction inv");
                    peer.send(NetworkMessage::GetData(vec![Inventory::Transaction(txid)]))
                        .await?;
                }
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => {
                    if self.state() == ChainSyncState::Waiting {
                        tracing::debug!(peer = %peer.id(), %hash, "Block inv, requesting filtered block");
                        peer.send(NetworkMessage::GetData(vec![filtered_block_inv(hash)]))
                            .await?;
                    }
                    // The sync loop will pick it up otherwise.
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Serve our own transactions back to peers that react to our invs.
    async fn on_getdata(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        inv: Vec<Inventory>,
    ) -> NetworkResult<()> {
        for item in inv {
            if let Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) = item {
                if let Ok(record) = self.txstore.transaction(&txid).await {
                    if record.is_dead() {
                        continue;
                    }
                    match deserialize::<Transaction>(&record.raw) {
                        Ok(tx) => peer.send(NetworkMessage::Tx(tx)).await?,
                        Err(e) => {
                            tracing::error!(%txid, "Stored transaction undecodable: {}", e)
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
