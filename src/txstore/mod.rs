//! Address/script matching and UTXO bookkeeping.
//!
//! The matcher owns the in-memory view of everything the wallet can spend
//! or watch: derived scripts, watched scripts, the UTXO and STXO tables
//! and known transactions. One mutex guards the whole aggregate for the
//! duration of an ingest; ingestion reshapes the tables and the bloom
//! filter, so it is serialized across peers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::merkle_tree::MerkleBlock;
use bitcoin::p2p::message_bloom::BloomFlags;
use bitcoin::{OutPoint, Script, ScriptBuf, Transaction, Txid};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::bloom::BloomFilter;
use crate::chain::NetworkParams;
use crate::error::{NetworkError, NetworkResult, Result, StoreError};
use crate::keys::KeyManager;
use crate::store::WalletStore;
use crate::types::{KeyPath, Stxo, TransactionEvent, TxRecord, Utxo};

/// Bloom filter false positive rate pushed to peers.
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 1e-6;

/// Callback invoked with an owned copy of every ingested transaction.
/// Listeners must not call back into the wallet synchronously.
pub type TransactionListener = Box<dyn Fn(TransactionEvent) + Send + Sync>;

#[derive(Default)]
struct Tables {
    /// Derived script bytes to their key paths.
    adrs: HashMap<ScriptBuf, KeyPath>,
    watched: HashSet<ScriptBuf>,
    utxos: HashMap<OutPoint, Utxo>,
    stxos: HashMap<OutPoint, Stxo>,
    /// Known wallet txids and their heights.
    txids: HashMap<Txid, i32>,
}

/// The transaction store and script matcher.
pub struct TxStore {
    #[allow(dead_code)]
    params: NetworkParams,
    store: Arc<dyn WalletStore>,
    keys: Arc<KeyManager>,
    tables: Mutex<Tables>,
    listeners: std::sync::Mutex<Vec<TransactionListener>>,
    /// Pinged whenever the filter element set changes; the peer layer
    /// rebuilds and resends `filterload` on receipt.
    filter_refresh: std::sync::Mutex<Option<UnboundedSender<()>>>,
}

impl TxStore {
    /// Build the matcher and populate the in-memory tables from the store.
    pub async fn new(
        params: NetworkParams,
        store: Arc<dyn WalletStore>,
        keys: Arc<KeyManager>,
    ) -> Result<Self> {
        let txstore = Self {
            params,
            store,
            keys,
            tables: Mutex::new(Tables::default()),
            listeners: std::sync::Mutex::new(Vec::new()),
            filter_refresh: std::sync::Mutex::new(None),
        };
        txstore.populate().await?;
        Ok(txstore)
    }

    /// Reload scripts, outputs and txids from the record store.
    pub async fn populate(&self) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.adrs.clear();
        for (script, path) in
            self.keys.all_scripts().await.map_err(crate::error::WalletError::Keychain)?
        {
            tables.adrs.insert(script, path);
        }
        tables.watched = self.store.watched_scripts().all().await?.into_iter().collect();
        tables.utxos =
            self.store.utxos().all().await?.into_iter().map(|u| (u.outpoint, u)).collect();
        tables.stxos =
            self.store.stxos().all().await?.into_iter().map(|s| (s.utxo.outpoint, s)).collect();
        tables.txids =
            self.store.txns().all(true).await?.into_iter().map(|t| (t.txid, t.height)).collect();
        tracing::debug!(
            scripts = tables.adrs.len(),
            watched = tables.watched.len(),
            utxos = tables.utxos.len(),
            stxos = tables.stxos.len(),
            txns = tables.txids.len(),
            "Populated matcher tables"
        );
        Ok(())
    }

    /// Register the channel pinged on filter element changes.
    pub fn set_filter_refresh(&self, sender: UnboundedSender<()>) {
        *self.filter_refresh.lock().expect("filter refresh mutex") = Some(sender);
    }

    fn request_filter_refresh(&self) {
        if let Some(sender) = self.filter_refresh.lock().expect("filter refresh mutex").as_ref() {
            let _ = sender.send(());
        }
    }

    /// Subscribe to ingested transactions.
    pub fn add_listener(&self, listener: TransactionListener) {
        self.listeners.lock().expect("listener mutex").push(listener);
    }

    fn notify(&self, event: TransactionEvent) {
        for listener in self.listeners.lock().expect("listener mutex").iter() {
            listener(event.clone());
        }
    }

    /// Build the BIP37 filter over every address hash and outpoint the
    /// wallet cares about.
    pub async fn bloom_filter(&self) -> BloomFilter {
        let tables = self.tables.lock().await;
        let elements =
            tables.adrs.len() + tables.watched.len() + tables.utxos.len() + tables.stxos.len();
        let mut filter =
            BloomFilter::new(elements as u32, BLOOM_FALSE_POSITIVE_RATE, 0, BloomFlags::All);
        for script in tables.adrs.keys().chain(tables.watched.iter()) {
            filter.insert(&filter_element_for_script(script));
        }
        for outpoint in tables.utxos.keys().chain(tables.stxos.keys()) {
            filter.insert_outpoint(outpoint);
        }
        filter
    }

    /// Ingest a transaction discovered at `height` (0 for unconfirmed).
    /// Returns the number of script and outpoint hits; 0 means the
    /// transaction is not relevant to this wallet.
    pub async fn ingest(&self, tx: &Transaction, height: u32, timestamp: u64) -> Result<u32> {
        let txid = tx.compute_txid();
        let mut tables = self.tables.lock().await;

        let mut hits = 0u32;
        let mut value: i64 = 0;
        let mut matched_scripts: Vec<ScriptBuf> = Vec::new();
        let mut watch_deposits: Vec<(u32, ScriptBuf, bitcoin::Amount)> = Vec::new();
        let mut deposits: Vec<(u32, ScriptBuf, bitcoin::Amount)> = Vec::new();
        let mut spends: Vec<OutPoint> = Vec::new();
        let mut stxo_updates: Vec<OutPoint> = Vec::new();

        for (vout, output) in tx.output.iter().enumerate() {
            if tables.adrs.contains_key(output.script_pubkey.as_script()) {
                hits += 1;
                value += output.value.to_sat() as i64;
                matched_scripts.push(output.script_pubkey.clone());
                deposits.push((vout as u32, output.script_pubkey.clone(), output.value));
            } else if tables.watched.contains(output.script_pubkey.as_script()) {
                hits += 1;
                watch_deposits.push((vout as u32, output.script_pubkey.clone(), output.value));
            }
        }

        for input in &tx.input {
            if let Some(utxo) = tables.utxos.get(&input.previous_output) {
                hits += 1;
                value -= utxo.value.to_sat() as i64;
                spends.push(input.previous_output);
            } else if let Some(stxo) = tables.stxos.get(&input.previous_output) {
                // A spend we already know about confirming at a new height.
                if stxo.spend_txid == txid {
                    hits += 1;
                    stxo_updates.push(input.previous_output);
                }
            }
        }

        if hits == 0 {
            return Ok(0);
        }

        let double_spends = self.find_double_spends(tx, &txid).await?;
        if !double_spends.is_empty() {
            if height > 0 {
                // A confirmed transaction supersedes whatever it conflicts
                // with; the losers and their descendants die.
                for conflicting in double_spends {
                    tracing::info!(%conflicting, winner = %txid, "Marking double spend as dead");
                    self.mark_as_dead_locked(&mut tables, conflicting).await?;
                }
            } else {
                tracing::debug!(%txid, "Dropping unconfirmed double spend");
                return Ok(0);
            }
        }

        let watch_only = deposits.is_empty() && spends.is_empty() && stxo_updates.is_empty();

        // Persist the transaction, or refresh the height of a known one.
        let known_height = tables.txids.get(&txid).copied();
        match known_height {
            Some(_) => {
                self.store.txns().update_height(&txid, height as i32).await?;
            }
            None => {
                self.store
                    .txns()
                    .put(TxRecord {
                        txid,
                        value,
                        height: height as i32,
                        timestamp,
                        watch_only,
                        raw: serialize(tx),
                    })
                    .await?;
            }
        }
        tables.txids.insert(txid, height as i32);

        let mut filter_dirty = false;

        for (vout, script, amount) in deposits {
            let outpoint = OutPoint {
                txid,
                vout,
            };
            let mut utxo = Utxo::new(outpoint, amount, script.clone(), height);
            if let Some(existing) = tables.utxos.get(&outpoint) {
                utxo.frozen = existing.frozen;
            } else {
                filter_dirty = true;
            }
            self.store.utxos().put(utxo.clone()).await?;
            tables.utxos.insert(outpoint, utxo);
        }

        for (vout, script, amount) in watch_deposits {
            let outpoint = OutPoint {
                txid,
                vout,
            };
            let mut utxo = Utxo::new(outpoint, amount, script, height);
            utxo.watch_only = true;
            if !tables.utxos.contains_key(&outpoint) {
                filter_dirty = true;
            }
            self.store.utxos().put(utxo.clone()).await?;
            tables.utxos.insert(outpoint, utxo);
        }

        for outpoint in spends {
            if let Some(utxo) = tables.utxos.remove(&outpoint) {
                let stxo = Stxo {
                    utxo: utxo.clone(),
                    spend_height: height,
                    spend_txid: txid,
                };
                self.store.utxos().delete(&utxo).await?;
                self.store.stxos().put(stxo.clone()).await?;
                tables.stxos.insert(outpoint, stxo);
            }
        }

        for outpoint in stxo_updates {
            if let Some(stxo) = tables.stxos.get_mut(&outpoint) {
                stxo.spend_height = height;
                self.store.stxos().put(stxo.clone()).await?;
            }
        }

        // Mark keys used after the tables settle; the lookahead extension
        // mints fresh scripts that must land in the address index.
        for script in matched_scripts {
            if let Some(path) = tables.adrs.get(script.as_script()).copied() {
                if !path.is_imported() {
                    self.keys
                        .mark_used(&script)
                        .await
                        .map_err(crate::error::WalletError::Keychain)?;
                    filter_dirty = true;
                }
            }
        }
        if filter_dirty {
            let refreshed = self
                .keys
                .all_scripts()
                .await
                .map_err(crate::error::WalletError::Keychain)?;
            for (script, path) in refreshed {
                tables.adrs.insert(script, path);
            }
        }

        drop(tables);

        if filter_dirty {
            self.request_filter_refresh();
        }

        self.notify(TransactionEvent {
            txid,
            value,
            height: height as i32,
            timestamp,
            watch_only,
        });

        Ok(hits)
    }

    /// Stored transactions that share an input with `tx` and are not `tx`.
    pub async fn check_double_spends(&self, tx: &Transaction) -> Result<Vec<Txid>> {
        let txid = tx.compute_txid();
        self.find_double_spends(tx, &txid).await
    }

    async fn find_double_spends(&self, tx: &Transaction, txid: &Txid) -> Result<Vec<Txid>> {
        let inputs: HashSet<OutPoint> = tx.input.iter().map(|i| i.previous_output).collect();
        let mut conflicts = Vec::new();
        for record in self.store.txns().all(true).await? {
            if record.txid == *txid || record.is_dead() {
                continue;
            }
            let stored: Transaction = match deserialize(&record.raw) {
                Ok(stored) => stored,
                Err(e) => {
                    return Err(StoreError::Corruption(format!(
                        "stored txn {}: {}",
                        record.txid, e
                    ))
                    .into())
                }
            };
            if stored.input.iter().any(|i| inputs.contains(&i.previous_output)) {
                conflicts.push(record.txid);
            }
        }
        Ok(conflicts)
    }

    /// Mark a transaction dead and cascade to everything that depended on
    /// its outputs.
    pub async fn mark_as_dead(&self, txid: Txid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.mark_as_dead_locked(&mut tables, txid).await
    }

    async fn mark_as_dead_locked(&self, tables: &mut Tables, txid: Txid) -> Result<()> {
        let mut queue = vec![txid];
        while let Some(dead) = queue.pop() {
            if self.store.txns().update_height(&dead, -1).await.is_ok() {
                tables.txids.insert(dead, -1);
            }

            // Outputs of the dead transaction disappear from the UTXO set.
            let own_outputs: Vec<OutPoint> =
                tables.utxos.keys().filter(|op| op.txid == dead).copied().collect();
            for outpoint in own_outputs {
                if let Some(utxo) = tables.utxos.remove(&outpoint) {
                    self.store.utxos().delete(&utxo).await?;
                }
            }

            let stxos: Vec<Stxo> = tables.stxos.values().cloned().collect();
            for stxo in stxos {
                if stxo.spend_txid == dead {
                    // The dead transaction was the spender: the spend never
                    // happened, so the output comes back unless its funding
                    // transaction is dead too.
                    tables.stxos.remove(&stxo.utxo.outpoint);
                    self.store.stxos().delete(&stxo).await?;
                    let funding_dead = stxo.utxo.outpoint.txid == dead
                        || tables
                            .txids
                            .get(&stxo.utxo.outpoint.txid)
                            .is_some_and(|h| *h < 0);
                    if !funding_dead {
                        let mut utxo = stxo.utxo.clone();
                        utxo.height = stxo.utxo.height;
                        self.store.utxos().put(utxo.clone()).await?;
                        tables.utxos.insert(utxo.outpoint, utxo);
                    }
                } else if stxo.utxo.outpoint.txid == dead {
                    // Someone spent an output of the dead transaction: that
                    // spender dies with it.
                    tables.stxos.remove(&stxo.utxo.outpoint);
                    self.store.stxos().delete(&stxo).await?;
                    queue.push(stxo.spend_txid);
                }
            }
        }
        Ok(())
    }

    /// Roll the wallet state back past a reorganization. Everything that
    /// confirmed above the fork height is unwound.
    pub async fn process_reorg(&self, fork_height: u32) -> Result<()> {
        let mut tables = self.tables.lock().await;

        let reorged: Vec<Txid> = self
            .store
            .txns()
            .all(true)
            .await?
            .into_iter()
            .filter(|r| r.height > fork_height as i32)
            .map(|r| r.txid)
            .collect();
        for txid in reorged {
            tracing::info!(%txid, fork_height, "Transaction reorged away");
            self.mark_as_dead_locked(&mut tables, txid).await?;
        }

        let reverted: Vec<Stxo> = tables
            .stxos
            .values()
            .filter(|s| s.spend_height > fork_height)
            .cloned()
            .collect();
        for stxo in reverted {
            tables.stxos.remove(&stxo.utxo.outpoint);
            self.store.stxos().delete(&stxo).await?;
            self.store.utxos().put(stxo.utxo.clone()).await?;
            tables.utxos.insert(stxo.utxo.outpoint, stxo.utxo);
        }

        let orphaned: Vec<OutPoint> = tables
            .utxos
            .values()
            .filter(|u| u.height > fork_height)
            .map(|u| u.outpoint)
            .collect();
        for outpoint in orphaned {
            if let Some(utxo) = tables.utxos.remove(&outpoint) {
                self.store.utxos().delete(&utxo).await?;
            }
        }

        Ok(())
    }

    /// Inventory of everything worth rebroadcasting: unconfirmed
    /// transactions and unconfirmed spends.
    pub async fn pending_inv(&self) -> Vec<Txid> {
        let tables = self.tables.lock().await;
        let mut pending = HashSet::new();
        for utxo in tables.utxos.values() {
            if utxo.height == 0 {
                pending.insert(utxo.outpoint.txid);
            }
        }
        for stxo in tables.stxos.values() {
            if stxo.spend_height == 0 {
                pending.insert(stxo.spend_txid);
            }
        }
        pending.into_iter().collect()
    }

    /// Add a raw script to the watch set and refresh the filter.
    pub async fn watch_script(&self, script: ScriptBuf) -> Result<()> {
        self.store.watched_scripts().put(script.clone()).await?;
        {
            let mut tables = self.tables.lock().await;
            tables.watched.insert(script);
        }
        self.request_filter_refresh();
        Ok(())
    }

    /// Snapshot of the UTXO table.
    pub async fn utxos(&self) -> Vec<Utxo> {
        self.tables.lock().await.utxos.values().cloned().collect()
    }

    /// Snapshot of the STXO table.
    pub async fn stxos(&self) -> Vec<Stxo> {
        self.tables.lock().await.stxos.values().cloned().collect()
    }

    /// All stored transactions.
    pub async fn transactions(&self, include_watch_only: bool) -> Result<Vec<TxRecord>> {
        Ok(self.store.txns().all(include_watch_only).await?)
    }

    /// One stored transaction.
    pub async fn transaction(&self, txid: &Txid) -> Result<TxRecord> {
        Ok(self.store.txns().get(txid).await?)
    }
}

/// The element pushed into the bloom filter for a script: the hash160
/// payload for standard scripts, the raw bytes otherwise. Peers test the
/// pushed data elements of each output script, so full scriptPubKeys
/// would never match.
fn filter_element_for_script(script: &Script) -> Vec<u8> {
    let bytes = script.as_bytes();
    if script.is_p2pkh() {
        bytes[3..23].to_vec()
    } else if script.is_p2sh() {
        bytes[2..22].to_vec()
    } else {
        bytes.to_vec()
    }
}

/// Verify a merkle block's partial tree and extract the matched txids.
pub fn merkle_block_txids(mb: &MerkleBlock) -> NetworkResult<Vec<Txid>> {
    let mut matches = Vec::new();
    let mut indexes = Vec::new();
    mb.extract_matches(&mut matches, &mut indexes)
        .map_err(|e| NetworkError::MalformedMerkleBlock(e.to_string()))?;
    Ok(matches)
}
