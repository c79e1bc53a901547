//! Peer connection management.
//!
//! Maintains a target number of outbound connections (exactly one when
//! pinned to a trusted peer), designates a single download peer for the
//! header and block walk, and retries failed endpoints with exponential
//! backoff.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::Txid;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::{Blockchain, NetworkParams};
use crate::error::NetworkResult;
use crate::network::discovery::DnsDiscovery;
use crate::network::peer::{Dialer, MessageReader, Peer, TcpDialer};
use crate::network::sync::SyncController;
use crate::network::{INACTIVITY_TIMEOUT, TARGET_PEERS, USER_AGENT};
use crate::txstore::TxStore;
use crate::types::{PeerId, PeerInfo};

/// How often connection maintenance runs.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Base reconnect delay; doubles per failed attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Ceiling on the reconnect delay.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(600);

/// Shared view of connected peers, used by both the manager and the sync
/// controller.
pub struct PeerRegistry {
    peers: std::sync::Mutex<HashMap<PeerId, Arc<Peer>>>,
    download_peer: std::sync::Mutex<Option<PeerId>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: std::sync::Mutex::new(HashMap::new()),
            download_peer: std::sync::Mutex::new(None),
        }
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers.lock().expect("peer map mutex").insert(peer.id(), peer);
    }

    pub fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().expect("peer map mutex").remove(&id)
    }

    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .expect("peer map mutex")
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.lock().expect("peer map mutex").values().filter(|p| p.is_connected()).count()
    }

    pub fn has_address(&self, address: SocketAddr) -> bool {
        self.peers.lock().expect("peer map mutex").values().any(|p| p.address() == address)
    }

    pub fn download_peer(&self) -> Option<Arc<Peer>> {
        let id = (*self.download_peer.lock().expect("download peer mutex"))?;
        self.peers.lock().expect("peer map mutex").get(&id).cloned()
    }

    pub fn set_download_peer(&self, id: Option<PeerId>) {
        *self.download_peer.lock().expect("download peer mutex") = id;
    }

    pub fn is_download_peer(&self, id: PeerId) -> bool {
        *self.download_peer.lock().expect("download peer mutex") == Some(id)
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer manager configuration.
#[derive(Clone)]
pub struct PeerManagerConfig {
    pub params: NetworkParams,
    pub user_agent: String,
    /// When set, this is the only peer ever dialed.
    pub trusted_peer: Option<SocketAddr>,
    pub target_peers: usize,
}

impl PeerManagerConfig {
    pub fn new(params: NetworkParams) -> Self {
        Self {
            params,
            user_agent: USER_AGENT.to_string(),
            trusted_peer: None,
            target_peers: TARGET_PEERS,
        }
    }

    fn effective_target(&self) -> usize {
        if self.trusted_peer.is_some() {
            1
        } else {
            self.target_peers
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    next_attempt: Instant,
}

/// Dials peers, owns their read loops, and replaces the download peer
/// when it drops.
pub struct PeerManager {
    config: PeerManagerConfig,
    chain: Arc<Blockchain>,
    txstore: Arc<TxStore>,
    registry: Arc<PeerRegistry>,
    sync: Arc<SyncController>,
    dialer: Arc<dyn Dialer>,
    discovery: DnsDiscovery,
    cancel: CancellationToken,
    next_id: AtomicU64,
    retries: std::sync::Mutex<HashMap<SocketAddr, RetryState>>,
}

impl PeerManager {
    pub fn new(
        config: PeerManagerConfig,
        chain: Arc<Blockchain>,
        txstore: Arc<TxStore>,
        registry: Arc<PeerRegistry>,
        sync: Arc<SyncController>,
        dialer: Option<Arc<dyn Dialer>>,
    ) -> Self {
        Self {
            config,
            chain,
            txstore,
            registry,
            sync,
            dialer: dialer.unwrap_or_else(|| Arc::new(TcpDialer)),
            discovery: DnsDiscovery::new(),
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(0),
            retries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    /// Start connection maintenance and the filter refresh drain.
    pub fn start(self: &Arc<Self>) {
        let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
        self.txstore.set_filter_refresh(refresh_tx);

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    received = refresh_rx.recv() => {
                        if received.is_none() {
                            return;
                        }
                        manager.send_filter_to_all().await;
                    }
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = ticker.tick() => manager.maintain().await,
                }
            }
        });
    }

    /// Disconnect everything and stop maintenance.
    pub fn stop(&self) {
        tracing::info!("Disconnecting from peers and shutting down");
        self.cancel.cancel();
        let peers: Vec<Arc<Peer>> = {
            let map = self.registry.peers.lock().expect("peer map mutex");
            map.values().cloned().collect()
        };
        for peer in peers {
            peer.mark_disconnected();
        }
    }

    /// Info for every known peer.
    pub fn peer_info(&self) -> Vec<PeerInfo> {
        let map = self.registry.peers.lock().expect("peer map mutex");
        map.values().map(|p| p.info(self.registry.is_download_peer(p.id()))).collect()
    }

    /// Announce a transaction to every connected peer.
    pub async fn broadcast_inv(&self, txid: Txid) {
        let inv = vec![Inventory::Transaction(txid)];
        for peer in self.registry.connected_peers() {
            if let Err(e) = peer.send(NetworkMessage::Inv(inv.clone())).await {
                tracing::debug!(peer = %peer.id(), "Inv broadcast failed: {}", e);
            }
        }
    }

    /// Rebuild the bloom filter and push it to every connected peer.
    pub async fn send_filter_to_all(&self) {
        let filter = self.txstore.bloom_filter().await;
        let load = filter.to_filter_load();
        for peer in self.registry.connected_peers() {
            if let Err(e) = peer.send(NetworkMessage::FilterLoad(load.clone())).await {
                tracing::debug!(peer = %peer.id(), "Filter send failed: {}", e);
            }
            peer.reset_false_positives();
        }
        tracing::debug!("Filter sent to all connected peers");
    }

    async fn maintain(self: &Arc<Self>) {
        let target = self.config.effective_target();
        let connected = self.registry.connected_count();
        if connected >= target {
            return;
        }

        let candidates: Vec<SocketAddr> = match self.config.trusted_peer {
            Some(addr) => vec![addr],
            None => self.discovery.discover_peers(&self.config.params).await,
        };

        let now = Instant::now();
        let mut started = 0usize;
        for address in candidates {
            if connected + started >= target {
                break;
            }
            if self.registry.has_address(address) {
                continue;
            }
            // Endpoints on the cold list wait out their backoff.
            let cold = {
                let retries = self.retries.lock().expect("retry map mutex");
                retries.get(&address).map(|r| r.next_attempt > now).unwrap_or(false)
            };
            if cold {
                continue;
            }
            started += 1;
            let manager = self.clone();
            tokio::spawn(async move {
                manager.connect_and_run(address).await;
            });
        }
    }

    fn record_failure(&self, address: SocketAddr) {
        let mut retries = self.retries.lock().expect("retry map mutex");
        let entry = retries.entry(address).or_insert(RetryState {
            attempts: 0,
            next_attempt: Instant::now(),
        });
        entry.attempts += 1;
        let delay = RETRY_BASE_DELAY
            .saturating_mul(1u32 << entry.attempts.min(7))
            .min(RETRY_MAX_DELAY);
        entry.next_attempt = Instant::now() + delay;
        tracing::debug!(%address, attempts = entry.attempts, "Peer cold-listed for {:?}", delay);
    }

    fn clear_failures(&self, address: SocketAddr) {
        self.retries.lock().expect("retry map mutex").remove(&address);
    }

    async fn connect_and_run(self: Arc<Self>, address: SocketAddr) {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let start_height = self.chain.height().unwrap_or(0) as i32;

        let (peer, mut reader) =
            match Peer::connect(id, address, self.config.params.magic, self.dialer.as_ref()).await
            {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::debug!(%address, "Connection failed: {}", e);
                    self.record_failure(address);
                    return;
                }
            };
        let peer = Arc::new(peer);

        if let Err(e) =
            peer.handshake(&mut reader, start_height, &self.config.user_agent).await
        {
            tracing::debug!(%address, "Handshake failed: {}", e);
            self.record_failure(address);
            return;
        }

        // Load our filter before anything else so every inv and filtered
        // block reflects the wallet's scripts.
        let filter = self.txstore.bloom_filter().await;
        if let Err(e) = peer.send(NetworkMessage::FilterLoad(filter.to_filter_load())).await {
            tracing::debug!(%address, "Initial filter send failed: {}", e);
            self.record_failure(address);
            return;
        }

        self.clear_failures(address);
        self.registry.insert(peer.clone());
        tracing::info!(peer = %id, %address, "Peer ready");

        let needs_download_peer = self.registry.download_peer().is_none();
        if needs_download_peer {
            self.registry.set_download_peer(Some(id));
            tracing::info!(peer = %id, %address, "Selected download peer");
            if let Err(e) = self.sync.ask_for_headers(&peer).await {
                tracing::warn!(peer = %id, "Initial getheaders failed: {}", e);
            }
        }

        self.read_loop(&peer, &mut reader).await;

        peer.mark_disconnected();
        self.registry.remove(id);
        if self.registry.is_download_peer(id) {
            self.registry.set_download_peer(None);
            self.select_download_peer().await;
        }
        tracing::info!(peer = %id, %address, "Peer disconnected");
    }

    async fn read_loop(&self, peer: &Arc<Peer>, reader: &mut MessageReader) {
        let mut last_activity = Instant::now();
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = reader.read_message() => result,
            };
            match message {
                Ok(Some(message)) => {
                    last_activity = Instant::now();
                    if let Err(e) = self.sync.handle_message(peer, message).await {
                        tracing::warn!(peer = %peer.id(), "Dropping peer: {}", e);
                        return;
                    }
                }
                Ok(None) => {
                    // Read timer fired without data: probe or give up.
                    if last_activity.elapsed() > INACTIVITY_TIMEOUT {
                        tracing::info!(peer = %peer.id(), "Peer inactive, dropping");
                        return;
                    }
                    if peer.send(NetworkMessage::Ping(rand::random::<u64>())).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer.id(), "Read failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Pick a replacement download peer and restart the header walk on it.
    async fn select_download_peer(&self) {
        let candidate = self.registry.connected_peers().into_iter().next();
        if let Some(peer) = candidate {
            self.registry.set_download_peer(Some(peer.id()));
            tracing::info!(peer = %peer.id(), "Reselected download peer");
            if let Err(e) = self.sync.ask_for_headers(&peer).await {
                tracing::warn!(peer = %peer.id(), "getheaders to new download peer failed: {}", e);
            }
        }
    }

    /// Send a raw message through the download peer, if any.
    pub async fn send_via_download_peer(&self, message: NetworkMessage) -> NetworkResult<()> {
        match self.registry.download_peer() {
            Some(peer) => peer.send(message).await,
            None => Err(crate::error::NetworkError::PeerDisconnected),
        }
    }
}
