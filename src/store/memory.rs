//! In-memory record store.
//!
//! Used by the test suite and as the default backend; production callers
//! can substitute any implementation of the store traits.

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::{PrivateKey, Script, ScriptBuf, Txid};
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    KeyStore, MetadataStore, StxoStore, TxnStore, UtxoStore, WalletStore, WatchedScriptStore,
};
use crate::types::{KeyPath, KeyPurpose, Stxo, TxRecord, Utxo};

#[derive(Debug, Clone)]
struct KeyEntry {
    path: KeyPath,
    used: bool,
    imported: Option<PrivateKey>,
}

#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<ScriptBuf, KeyEntry>>,
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn put(&self, script: &Script, path: KeyPath) -> StoreResult<()> {
        self.keys.write().await.insert(
            script.to_owned(),
            KeyEntry {
                path,
                used: false,
                imported: None,
            },
        );
        Ok(())
    }

    async fn import_key(&self, script: &Script, key: PrivateKey) -> StoreResult<()> {
        self.keys.write().await.insert(
            script.to_owned(),
            KeyEntry {
                path: KeyPath::imported(),
                used: false,
                imported: Some(key),
            },
        );
        Ok(())
    }

    async fn mark_used(&self, script: &Script) -> StoreResult<()> {
        let mut keys = self.keys.write().await;
        let entry = keys
            .get_mut(script)
            .ok_or_else(|| StoreError::NotFound("key for script".into()))?;
        entry.used = true;
        Ok(())
    }

    async fn last_index(&self, purpose: KeyPurpose) -> StoreResult<Option<(i32, bool)>> {
        let keys = self.keys.read().await;
        let mut last: Option<(i32, bool)> = None;
        for entry in keys.values() {
            if entry.path.purpose == purpose && !entry.path.is_imported() {
                match last {
                    Some((index, _)) if entry.path.index <= index => {}
                    _ => last = Some((entry.path.index, entry.used)),
                }
            }
        }
        Ok(last)
    }

    async fn path_for_script(&self, script: &Script) -> StoreResult<KeyPath> {
        let keys = self.keys.read().await;
        match keys.get(script) {
            Some(entry) if !entry.path.is_imported() => Ok(entry.path),
            _ => Err(StoreError::NotFound("path for script".into())),
        }
    }

    async fn key_for_script(&self, script: &Script) -> StoreResult<PrivateKey> {
        let keys = self.keys.read().await;
        keys.get(script)
            .and_then(|entry| entry.imported)
            .ok_or_else(|| StoreError::NotFound("imported key for script".into()))
    }

    async fn unused(&self, purpose: KeyPurpose) -> StoreResult<Vec<i32>> {
        let keys = self.keys.read().await;
        let mut indices: Vec<i32> = keys
            .values()
            .filter(|e| e.path.purpose == purpose && !e.used && !e.path.is_imported())
            .map(|e| e.path.index)
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    async fn all(&self) -> StoreResult<Vec<KeyPath>> {
        Ok(self.keys.read().await.values().map(|e| e.path).collect())
    }

    async fn all_scripts(&self) -> StoreResult<Vec<(ScriptBuf, KeyPath)>> {
        Ok(self
            .keys
            .read()
            .await
            .iter()
            .map(|(script, entry)| (script.clone(), entry.path))
            .collect())
    }

    async fn lookahead_windows(&self) -> StoreResult<HashMap<KeyPurpose, u32>> {
        let keys = self.keys.read().await;
        let mut windows = HashMap::new();
        for purpose in [KeyPurpose::External, KeyPurpose::Internal] {
            let last_used = keys
                .values()
                .filter(|e| e.path.purpose == purpose && e.used)
                .map(|e| e.path.index)
                .max()
                .unwrap_or(-1);
            let unused = keys
                .values()
                .filter(|e| {
                    e.path.purpose == purpose
                        && !e.used
                        && !e.path.is_imported()
                        && e.path.index > last_used
                })
                .count() as u32;
            windows.insert(purpose, unused);
        }
        Ok(windows)
    }
}

#[derive(Default)]
pub struct MemoryUtxoStore {
    utxos: RwLock<HashMap<bitcoin::OutPoint, Utxo>>,
}

#[async_trait]
impl UtxoStore for MemoryUtxoStore {
    async fn put(&self, utxo: Utxo) -> StoreResult<()> {
        self.utxos.write().await.insert(utxo.outpoint, utxo);
        Ok(())
    }

    async fn all(&self) -> StoreResult<Vec<Utxo>> {
        Ok(self.utxos.read().await.values().cloned().collect())
    }

    async fn set_watch_only(&self, utxo: &Utxo) -> StoreResult<()> {
        let mut utxos = self.utxos.write().await;
        let entry = utxos
            .get_mut(&utxo.outpoint)
            .ok_or_else(|| StoreError::NotFound("utxo".into()))?;
        entry.watch_only = true;
        Ok(())
    }

    async fn delete(&self, utxo: &Utxo) -> StoreResult<()> {
        self.utxos.write().await.remove(&utxo.outpoint);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStxoStore {
    stxos: RwLock<HashMap<bitcoin::OutPoint, Stxo>>,
}

#[async_trait]
impl StxoStore for MemoryStxoStore {
    async fn put(&self, stxo: Stxo) -> StoreResult<()> {
        self.stxos.write().await.insert(stxo.utxo.outpoint, stxo);
        Ok(())
    }

    async fn all(&self) -> StoreResult<Vec<Stxo>> {
        Ok(self.stxos.read().await.values().cloned().collect())
    }

    async fn delete(&self, stxo: &Stxo) -> StoreResult<()> {
        self.stxos.write().await.remove(&stxo.utxo.outpoint);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTxnStore {
    txns: RwLock<HashMap<Txid, TxRecord>>,
}

#[async_trait]
impl TxnStore for MemoryTxnStore {
    async fn put(&self, record: TxRecord) -> StoreResult<()> {
        self.txns.write().await.insert(record.txid, record);
        Ok(())
    }

    async fn get(&self, txid: &Txid) -> StoreResult<TxRecord> {
        self.txns
            .read()
            .await
            .get(txid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("txn {}", txid)))
    }

    async fn all(&self, include_watch_only: bool) -> StoreResult<Vec<TxRecord>> {
        Ok(self
            .txns
            .read()
            .await
            .values()
            .filter(|r| include_watch_only || !r.watch_only)
            .cloned()
            .collect())
    }

    async fn update_height(&self, txid: &Txid, height: i32) -> StoreResult<()> {
        let mut txns = self.txns.write().await;
        let record =
            txns.get_mut(txid).ok_or_else(|| StoreError::NotFound(format!("txn {}", txid)))?;
        record.height = height;
        Ok(())
    }

    async fn delete(&self, txid: &Txid) -> StoreResult<()> {
        self.txns.write().await.remove(txid);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWatchedScriptStore {
    scripts: RwLock<HashMap<ScriptBuf, ()>>,
}

#[async_trait]
impl WatchedScriptStore for MemoryWatchedScriptStore {
    async fn put(&self, script: ScriptBuf) -> StoreResult<()> {
        self.scripts.write().await.insert(script, ());
        Ok(())
    }

    async fn all(&self) -> StoreResult<Vec<ScriptBuf>> {
        Ok(self.scripts.read().await.keys().cloned().collect())
    }

    async fn delete(&self, script: &Script) -> StoreResult<()> {
        self.scripts.write().await.remove(script);
        Ok(())
    }
}

/// In-memory implementation of the full store seam.
#[derive(Default)]
pub struct MemoryWalletStore {
    keys: MemoryKeyStore,
    utxos: MemoryUtxoStore,
    stxos: MemoryStxoStore,
    txns: MemoryTxnStore,
    watched: MemoryWatchedScriptStore,
    metadata: RwLock<HashMap<String, String>>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalletStore for MemoryWalletStore {
    fn keys(&self) -> &dyn KeyStore {
        &self.keys
    }

    fn utxos(&self) -> &dyn UtxoStore {
        &self.utxos
    }

    fn stxos(&self) -> &dyn StxoStore {
        &self.stxos
    }

    fn txns(&self) -> &dyn TxnStore {
        &self.txns
    }

    fn watched_scripts(&self) -> &dyn WatchedScriptStore {
        &self.watched
    }
}

#[async_trait]
impl MetadataStore for MemoryWalletStore {
    async fn mnemonic(&self) -> StoreResult<String> {
        self.metadata
            .read()
            .await
            .get("mnemonic")
            .cloned()
            .ok_or_else(|| StoreError::NotFound("mnemonic".into()))
    }

    async fn set_mnemonic(&self, mnemonic: &str) -> StoreResult<()> {
        self.metadata.write().await.insert("mnemonic".into(), mnemonic.into());
        Ok(())
    }

    async fn creation_date(&self) -> StoreResult<u64> {
        self.metadata
            .read()
            .await
            .get("creation_date")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::NotFound("creation_date".into()))
    }

    async fn set_creation_date(&self, timestamp: u64) -> StoreResult<()> {
        self.metadata.write().await.insert("creation_date".into(), timestamp.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, OutPoint};

    fn script(byte: u8) -> ScriptBuf {
        ScriptBuf::from_bytes(vec![0x76, 0xa9, byte])
    }

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([byte; 32]),
            vout,
        }
    }

    #[tokio::test]
    async fn key_store_indices_and_lookahead() {
        let store = MemoryKeyStore::default();
        for i in 0..5 {
            store
                .put(&script(i as u8), KeyPath::new(KeyPurpose::External, i))
                .await
                .unwrap();
        }
        assert_eq!(store.last_index(KeyPurpose::External).await.unwrap(), Some((4, false)));
        assert_eq!(store.last_index(KeyPurpose::Internal).await.unwrap(), None);

        store.mark_used(&script(1)).await.unwrap();
        assert_eq!(store.unused(KeyPurpose::External).await.unwrap(), vec![0, 2, 3, 4]);

        let windows = store.lookahead_windows().await.unwrap();
        // Indices 2, 3, 4 sit above the highest used index 1.
        assert_eq!(windows[&KeyPurpose::External], 3);
        assert_eq!(windows[&KeyPurpose::Internal], 0);
    }

    #[tokio::test]
    async fn imported_keys_are_invisible_to_paths() {
        let store = MemoryKeyStore::default();
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let (sk, _) = secp.generate_keypair(&mut rand::thread_rng());
        let key = PrivateKey::new(sk, bitcoin::NetworkKind::Main);

        store.import_key(&script(9), key).await.unwrap();
        assert!(store.path_for_script(&script(9)).await.is_err());
        assert_eq!(store.key_for_script(&script(9)).await.unwrap(), key);
        // Imported keys do not count toward derivation indices.
        assert_eq!(store.last_index(KeyPurpose::External).await.unwrap(), None);
    }

    #[tokio::test]
    async fn utxo_stxo_round_trip() {
        let store = MemoryWalletStore::new();
        let utxo = Utxo::new(outpoint(1, 0), Amount::from_sat(1000), script(1), 5);
        store.utxos().put(utxo.clone()).await.unwrap();
        assert_eq!(store.utxos().all().await.unwrap().len(), 1);

        store.utxos().set_watch_only(&utxo).await.unwrap();
        assert!(store.utxos().all().await.unwrap()[0].watch_only);

        store.utxos().delete(&utxo).await.unwrap();
        assert!(store.utxos().all().await.unwrap().is_empty());

        let stxo = Stxo {
            utxo,
            spend_height: 9,
            spend_txid: Txid::from_byte_array([7; 32]),
        };
        store.stxos().put(stxo.clone()).await.unwrap();
        assert_eq!(store.stxos().all().await.unwrap().len(), 1);
        store.stxos().delete(&stxo).await.unwrap();
        assert!(store.stxos().all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn txn_store_heights_and_watch_filter() {
        let store = MemoryTxnStore::default();
        let txid = Txid::from_byte_array([1; 32]);
        store
            .put(TxRecord {
                txid,
                value: 100,
                height: 0,
                timestamp: 42,
                watch_only: true,
                raw: vec![1, 2, 3],
            })
            .await
            .unwrap();

        assert!(store.all(false).await.unwrap().is_empty());
        assert_eq!(store.all(true).await.unwrap().len(), 1);

        store.update_height(&txid, -1).await.unwrap();
        assert!(store.get(&txid).await.unwrap().is_dead());
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let store = MemoryWalletStore::new();
        assert!(store.mnemonic().await.is_err());
        store.set_mnemonic("abandon ability able").await.unwrap();
        assert_eq!(store.mnemonic().await.unwrap(), "abandon ability able");
        store.set_creation_date(1_600_000_000).await.unwrap();
        assert_eq!(store.creation_date().await.unwrap(), 1_600_000_000);
    }
}
