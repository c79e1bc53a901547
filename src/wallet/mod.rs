//! The wallet facade: composition root and public operations.

pub mod builder;

use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bip39::Mnemonic;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::consensus::serialize;
use bitcoin::{Address, BlockHash, Network, OutPoint, PrivateKey, ScriptBuf, Transaction, TxOut, Txid};

use crate::chain::{Blockchain, FileHeaderStore, HeaderStore, MemoryHeaderStore, NetworkParams};
use crate::config::WalletConfig;
use crate::error::{KeychainError, Result, WalletError};
use crate::fees::FeeProvider;
use crate::keys::KeyManager;
use crate::network::{PeerManager, PeerManagerConfig, PeerRegistry, SyncController};
use crate::store::{MetadataStore, WalletStore};
use crate::txstore::{TransactionListener, TxStore};
use crate::types::{FeeLevel, KeyPurpose, PeerInfo, TxRecord, Utxo};

pub use builder::{Coin, MultisigSignature, TxBuilder};

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A BIP37 SPV wallet.
///
/// Owns the record store, header store and peer manager; everything the
/// CLI/RPC/GUI layers need goes through the operations here.
pub struct SpvWallet {
    params: NetworkParams,
    metadata: Arc<dyn MetadataStore>,
    chain: Arc<Blockchain>,
    keys: Arc<KeyManager>,
    txstore: Arc<TxStore>,
    fees: Arc<FeeProvider>,
    builder: TxBuilder,
    registry: Arc<PeerRegistry>,
    sync: Arc<SyncController>,
    manager: Arc<PeerManager>,
}

impl SpvWallet {
    /// Assemble a wallet over the given record store. Derivation failure
    /// or an unseedable header store is fatal.
    pub async fn new<S>(config: WalletConfig, store: Arc<S>) -> Result<Self>
    where
        S: WalletStore + MetadataStore + 'static,
    {
        let params = NetworkParams::for_network(config.network);
        let metadata: Arc<dyn MetadataStore> = store.clone();
        let records: Arc<dyn WalletStore> = store.clone();

        let phrase = match metadata.mnemonic().await {
            Ok(phrase) => phrase,
            Err(_) => {
                let phrase = match &config.mnemonic {
                    Some(phrase) => phrase.clone(),
                    None => Mnemonic::generate(12)
                        .map_err(|e| KeychainError::InvalidMnemonic(e.to_string()))
                        .map_err(WalletError::Keychain)?
                        .to_string(),
                };
                metadata.set_mnemonic(&phrase).await.map_err(WalletError::Store)?;
                metadata.set_creation_date(unix_now()).await.map_err(WalletError::Store)?;
                phrase
            }
        };
        let mnemonic = Mnemonic::parse(&phrase)
            .map_err(|e| KeychainError::InvalidMnemonic(e.to_string()))
            .map_err(WalletError::Keychain)?;
        let seed = mnemonic.to_seed("");
        let master = Xpriv::new_master(bitcoin::NetworkKind::from(config.network), &seed)
            .map_err(KeychainError::Derivation)
            .map_err(WalletError::Keychain)?;

        let keys =
            Arc::new(KeyManager::new(records.clone(), params.clone(), master).await?);
        let txstore =
            Arc::new(TxStore::new(params.clone(), records, keys.clone()).await?);

        let header_store: Box<dyn HeaderStore> = match &config.data_dir {
            Some(dir) => Box::new(FileHeaderStore::open(dir)?),
            None => Box::new(MemoryHeaderStore::new()),
        };
        let chain = Arc::new(Blockchain::new(header_store, params.clone())?);

        let fees = Arc::new(FeeProvider::new(
            config.max_fee,
            config.priority_fee,
            config.normal_fee,
            config.economic_fee,
            config.fee_oracle_url.clone(),
        ));
        let builder =
            TxBuilder::new(chain.clone(), txstore.clone(), keys.clone(), fees.clone());

        let registry = Arc::new(PeerRegistry::new());
        let sync =
            Arc::new(SyncController::new(chain.clone(), txstore.clone(), registry.clone()));
        let mut peer_config = PeerManagerConfig::new(params.clone());
        peer_config.user_agent = config.user_agent.clone();
        peer_config.trusted_peer = config.trusted_peer;
        peer_config.target_peers = config.target_peers;
        let manager = Arc::new(PeerManager::new(
            peer_config,
            chain.clone(),
            txstore.clone(),
            registry.clone(),
            sync.clone(),
            None,
        ));

        Ok(Self {
            params,
            metadata,
            chain,
            keys,
            txstore,
            fees,
            builder,
            registry,
            sync,
            manager,
        })
    }

    /// Begin connecting and syncing. A fresh or restored wallet starts its
    /// block walk at the checkpoint.
    pub fn start(&self) {
        if self.sync.sync_height() == 0 {
            self.sync.set_sync_height(self.params.checkpoint_height());
        }
        self.manager.start();
        tracing::info!(network = %self.params.network, "Wallet started");
    }

    /// Disconnect from peers, prune deeply buried headers and flush the
    /// header store.
    pub fn close(&self) -> Result<()> {
        self.manager.stop();
        self.chain.prune()?;
        self.chain.close()?;
        Ok(())
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn network(&self) -> Network {
        self.params.network
    }

    /// The persisted BIP39 mnemonic.
    pub async fn mnemonic(&self) -> Result<String> {
        Ok(self.metadata.mnemonic().await?)
    }

    /// Wallet creation time as a unix timestamp.
    pub async fn creation_date(&self) -> Result<u64> {
        Ok(self.metadata.creation_date().await?)
    }

    pub fn master_private_key(&self) -> Xpriv {
        self.keys.master_private_key()
    }

    pub fn master_public_key(&self) -> Xpub {
        self.keys.master_public_key()
    }

    /// Address at the lowest unused index on a chain.
    pub async fn current_address(&self, purpose: KeyPurpose) -> Result<Address> {
        Ok(self.keys.current_address(purpose).await?)
    }

    /// Freshly derived, never-handed-out address.
    pub async fn new_address(&self, purpose: KeyPurpose) -> Result<Address> {
        let address = self.keys.fresh_address(purpose).await?;
        self.txstore.populate().await?;
        Ok(address)
    }

    /// Whether the wallet holds the key for an address.
    pub async fn has_key(&self, address: &Address) -> bool {
        self.keys.has_script(&address.script_pubkey()).await
    }

    /// Private key for one of the wallet's addresses.
    pub async fn get_key(&self, address: &Address) -> Result<PrivateKey> {
        Ok(self.keys.key_for_script(&address.script_pubkey()).await?)
    }

    /// Every derived address, external then internal.
    pub async fn list_addresses(&self) -> Result<Vec<Address>> {
        let mut addresses = Vec::new();
        for (_, path) in self.keys.all_scripts().await.map_err(WalletError::Keychain)? {
            if path.is_imported() {
                continue;
            }
            addresses
                .push(self.keys.derive_address(path.purpose, path.index as u32)?);
        }
        Ok(addresses)
    }

    /// Every spendable private key, derived and imported.
    pub async fn list_keys(&self) -> Result<Vec<PrivateKey>> {
        let mut keys = Vec::new();
        for (script, _) in self.keys.all_scripts().await.map_err(WalletError::Keychain)? {
            if let Ok(key) = self.keys.key_for_script(&script).await {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Import a single key (WIF or raw hex) outside the derivation tree.
    pub async fn import_key(&self, encoded: &str) -> Result<Address> {
        let address = self.keys.import_key(encoded).await?;
        self.txstore.populate().await?;
        Ok(address)
    }

    /// Height and hash of the best known header.
    pub fn chain_tip(&self) -> Result<(u32, BlockHash)> {
        let best = self.chain.best_header()?;
        Ok((best.height, best.block_hash()))
    }

    /// Confirmed and unconfirmed balance in satoshis.
    pub async fn balance(&self) -> (u64, u64) {
        let mut confirmed = 0u64;
        let mut unconfirmed = 0u64;
        for utxo in self.txstore.utxos().await {
            if utxo.frozen {
                continue;
            }
            if utxo.height > 0 {
                confirmed += utxo.value.to_sat();
            } else {
                unconfirmed += utxo.value.to_sat();
            }
        }
        (confirmed, unconfirmed)
    }

    /// All wallet transactions.
    pub async fn transactions(&self) -> Result<Vec<TxRecord>> {
        self.txstore.transactions(true).await
    }

    /// One wallet transaction.
    pub async fn get_transaction(&self, txid: &Txid) -> Result<TxRecord> {
        self.txstore.transaction(txid).await
    }

    /// Confirmation count and height of a transaction; (0, 0) while
    /// unconfirmed.
    pub async fn get_confirmations(&self, txid: &Txid) -> Result<(u32, u32)> {
        let record = self.txstore.transaction(txid).await?;
        if record.height <= 0 {
            return Ok((0, 0));
        }
        let height = record.height as u32;
        let tip = self.chain.height()?;
        if tip < height {
            return Ok((0, height));
        }
        Ok((tip - height + 1, height))
    }

    /// Current fee rate for a level.
    pub async fn get_fee_per_byte(&self, level: FeeLevel) -> u64 {
        self.fees.fee_per_byte(level).await
    }

    /// Fee for a transaction shape at a level's current rate.
    pub async fn estimate_fee(&self, inputs: usize, outputs: usize, level: FeeLevel) -> u64 {
        TxBuilder::estimate_fee(inputs, outputs, self.fees.fee_per_byte(level).await)
    }

    /// Spendable coins with keys and confirmation counts.
    pub async fn gather_coins(&self) -> Vec<Coin> {
        self.builder.gather_coins().await
    }

    /// Pay `amount` satoshis to `address`, sign, record locally and
    /// announce to peers.
    pub async fn spend(&self, amount: u64, address: &Address, level: FeeLevel) -> Result<Txid> {
        let tx = self.builder.spend(amount, address, level).await?;
        self.broadcast(tx).await
    }

    /// Replace an unconfirmed transaction with one paying the bump rate.
    pub async fn bump_fee(&self, txid: Txid) -> Result<Txid> {
        let tx = self.builder.bump_fee(txid).await?;
        self.broadcast(tx).await
    }

    /// Sweep arbitrary outputs with a supplied key.
    pub async fn sweep_address(
        &self,
        inputs: Vec<Utxo>,
        dest: Option<Address>,
        key: PrivateKey,
        redeem_script: Option<ScriptBuf>,
        level: FeeLevel,
    ) -> Result<Txid> {
        let tx = self.builder.sweep(inputs, dest, key, redeem_script, level).await?;
        self.broadcast(tx).await
    }

    /// One signature per input of an M-of-N spend.
    pub async fn create_multisig_signature(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        key: PrivateKey,
        redeem_script: &ScriptBuf,
        fee_per_byte: u64,
    ) -> Result<Vec<MultisigSignature>> {
        Ok(self
            .builder
            .create_multisig_signature(inputs, outputs, key, redeem_script, fee_per_byte)
            .await?)
    }

    /// Combine two signature sets; optionally record and announce the
    /// finished transaction. Returns its raw bytes.
    #[allow(clippy::too_many_arguments)]
    pub async fn multisign(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        sigs1: Vec<MultisigSignature>,
        sigs2: Vec<MultisigSignature>,
        redeem_script: &ScriptBuf,
        fee_per_byte: u64,
        broadcast: bool,
    ) -> Result<Vec<u8>> {
        let tx = self
            .builder
            .multisign(inputs, outputs, sigs1, sigs2, redeem_script, fee_per_byte)
            .await?;
        let bytes = serialize(&tx);
        if broadcast {
            self.broadcast(tx).await?;
        }
        Ok(bytes)
    }

    /// M-of-N redeem script and P2SH address over the given public keys.
    pub fn generate_multisig_script(
        &self,
        keys: &[bitcoin::PublicKey],
        threshold: usize,
    ) -> Result<(Address, ScriptBuf)> {
        Ok(self.builder.generate_multisig_script(keys, threshold)?)
    }

    /// Watch a raw scriptPubKey; matches ingest as watch-only.
    pub async fn add_watched_script(&self, script: ScriptBuf) -> Result<()> {
        self.txstore.watch_script(script).await
    }

    /// Subscribe to transaction notifications.
    pub fn add_transaction_listener(&self, listener: TransactionListener) {
        self.txstore.add_listener(listener);
    }

    /// Connected peer descriptions.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.manager.peer_info()
    }

    /// Roll wallet state back to `from_height` (clamped to the
    /// checkpoint) and walk the chain again. Re-seen transactions are
    /// ingested idempotently.
    pub async fn resync(&self, from_height: u32) -> Result<()> {
        let from = from_height.max(self.params.checkpoint_height());
        tracing::info!(from, "Resyncing blockchain");
        self.txstore.process_reorg(from).await?;
        self.sync.set_sync_height(from);
        if let Some(peer) = self.registry.download_peer() {
            self.sync.ask_for_headers(&peer).await.map_err(WalletError::Network)?;
        }
        Ok(())
    }

    /// Write the header database in a human-readable form.
    pub fn dump_headers(&self, writer: &mut dyn Write) -> Result<()> {
        Ok(self.chain.dump(writer)?)
    }

    /// Local transaction injection: record at height zero, then announce.
    /// This is the path every wallet-authored transaction takes.
    pub async fn ingest_transaction(&self, tx: &Transaction, height: u32) -> Result<u32> {
        self.txstore.ingest(tx, height, unix_now()).await
    }

    async fn broadcast(&self, tx: Transaction) -> Result<Txid> {
        let txid = tx.compute_txid();
        self.txstore.ingest(&tx, 0, unix_now()).await?;
        self.manager.broadcast_inv(txid).await;
        tracing::info!(%txid, "Transaction broadcast");
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryWalletStore;
    use bitcoin::consensus::deserialize;
    use bitcoin::{Amount, Sequence, TxIn, Witness};
    use std::str::FromStr;

    const FIXTURE_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    const TX1_HEX: &str = "0100000001f0c1a0d39f0f1357fcead5897f1eed424d9835d30d2543f3d804138ba825939b010000006b483045022100ed5c193377e4fb7d8df067c18e4982f55f2443cd9b41548347f646448cc5ad9f02202ad6ad5041246a23868bc52675c4c1a4018e1cfd180dcd63897fb9040df14d85012102e2606d87535c7b15855a854c09225ba025230f8b79332a6d1d06b39cd711f821ffffffff0264f3cc03000000001976a9148f83a59ebdf80b8cc965a28da3a825c126a4cefb88ac204e0000000000001976a9140706d0505002aa3ef07a822b9c143b0047b07bdf88ac00000000";

    async fn regtest_wallet() -> SpvWallet {
        let config = WalletConfig::new(Network::Regtest)
            .with_mnemonic(FIXTURE_MNEMONIC)
            .with_fees(5, 10, 20, 2000);
        SpvWallet::new(config, Arc::new(MemoryWalletStore::new())).await.unwrap()
    }

    /// Deposit `sats` to the wallet's external key 0 at `height`.
    async fn fund_wallet(wallet: &SpvWallet, sats: u64, height: u32) -> Transaction {
        let mut tx: Transaction = deserialize(&hex::decode(TX1_HEX).unwrap()).unwrap();
        let script = wallet.keys.derive_script(KeyPurpose::External, 0).unwrap();
        tx.output.push(TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: script,
        });
        wallet.ingest_transaction(&tx, height).await.unwrap();
        tx
    }

    fn foreign_address() -> Address {
        // Regtest P2PKH address unrelated to the fixture mnemonic.
        Address::from_str("mxVFsFW5N4mu1HPkxPttorvocvzeZ7KZyk")
            .unwrap()
            .require_network(Network::Regtest)
            .unwrap()
    }

    #[tokio::test]
    async fn mnemonic_persisted_on_first_start() {
        let store = Arc::new(MemoryWalletStore::new());
        let config = WalletConfig::new(Network::Regtest).with_mnemonic(FIXTURE_MNEMONIC);
        let wallet = SpvWallet::new(config, store.clone()).await.unwrap();
        assert_eq!(wallet.mnemonic().await.unwrap(), FIXTURE_MNEMONIC);
        assert!(wallet.creation_date().await.unwrap() > 0);

        // A second wallet over the same store reuses the stored phrase.
        let config = WalletConfig::new(Network::Regtest);
        let wallet2 = SpvWallet::new(config, store).await.unwrap();
        assert_eq!(wallet2.mnemonic().await.unwrap(), FIXTURE_MNEMONIC);
        assert_eq!(
            wallet.master_public_key().to_string(),
            wallet2.master_public_key().to_string()
        );
    }

    #[tokio::test]
    async fn deposit_updates_balance_and_tables() {
        let wallet = regtest_wallet().await;
        fund_wallet(&wallet, 100_000, 1).await;

        assert_eq!(wallet.balance().await, (100_000, 0));
        assert_eq!(wallet.txstore.utxos().await.len(), 1);
        assert_eq!(wallet.transactions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn spend_creates_change_and_stxo() {
        let wallet = regtest_wallet().await;
        let funding = fund_wallet(&wallet, 100_000, 1).await;
        let funding_outpoint = OutPoint {
            txid: funding.compute_txid(),
            vout: 2,
        };

        let txid = wallet.spend(50_000, &foreign_address(), FeeLevel::Normal).await.unwrap();

        let record = wallet.get_transaction(&txid).await.unwrap();
        assert_eq!(record.height, 0);

        let stxos = wallet.txstore.stxos().await;
        assert_eq!(stxos.len(), 1);
        assert_eq!(stxos[0].utxo.outpoint, funding_outpoint);
        assert_eq!(stxos[0].spend_txid, txid);

        // One unconfirmed change output; the original deposit is spent.
        let utxos = wallet.txstore.utxos().await;
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].outpoint.txid, txid);
        let fee = TxBuilder::estimate_fee(1, 2, 10);
        let (confirmed, unconfirmed) = wallet.balance().await;
        assert_eq!(confirmed, 0);
        assert_eq!(unconfirmed, 100_000 - 50_000 - fee);
    }

    #[tokio::test]
    async fn spend_rejects_insufficient_funds() {
        let wallet = regtest_wallet().await;
        fund_wallet(&wallet, 10_000, 1).await;
        let result = wallet.spend(50_000, &foreign_address(), FeeLevel::Normal).await;
        assert!(matches!(
            result,
            Err(WalletError::Builder(crate::error::BuilderError::InsufficientFunds))
        ));
    }

    #[tokio::test]
    async fn bump_fee_replaces_unconfirmed_spend() {
        let wallet = regtest_wallet().await;
        fund_wallet(&wallet, 100_000, 1).await;
        let original =
            wallet.spend(50_000, &foreign_address(), FeeLevel::Normal).await.unwrap();

        let replacement = wallet.bump_fee(original).await.unwrap();
        assert_ne!(replacement, original);

        assert!(wallet.get_transaction(&original).await.unwrap().is_dead());
        let new_record = wallet.get_transaction(&replacement).await.unwrap();
        assert_eq!(new_record.height, 0);

        // Effective rate meets the bump level.
        let raw: Transaction = deserialize(&new_record.raw).unwrap();
        let bump_rate = wallet.get_fee_per_byte(FeeLevel::FeeBump).await;
        let out_total: u64 = raw.output.iter().map(|o| o.value.to_sat()).sum();
        let fee = 100_000 - out_total;
        assert!(fee >= bump_rate * TxBuilder::estimate_size(1, 2));

        // The recipient output survives in the replacement.
        assert!(raw
            .output
            .iter()
            .any(|o| o.script_pubkey == foreign_address().script_pubkey()
                && o.value.to_sat() == 50_000));
    }

    #[tokio::test]
    async fn bump_fee_refuses_confirmed_transactions() {
        let wallet = regtest_wallet().await;
        let tx = fund_wallet(&wallet, 100_000, 5).await;
        let result = wallet.bump_fee(tx.compute_txid()).await;
        assert!(matches!(
            result,
            Err(WalletError::Builder(crate::error::BuilderError::UnconfirmedInputsForBump))
        ));
    }

    #[tokio::test]
    async fn confirmations_track_the_tip() {
        let wallet = regtest_wallet().await;
        for hex_header in crate::chain::engine::tests::CHAIN {
            wallet
                .chain
                .commit_header(&crate::chain::engine::tests::header_from_hex(hex_header))
                .unwrap();
        }
        let tx = fund_wallet(&wallet, 100_000, 4).await;
        let (confs, height) = wallet.get_confirmations(&tx.compute_txid()).await.unwrap();
        assert_eq!(height, 4);
        assert_eq!(confs, 10 - 4 + 1);

        let (tip_height, tip_hash) = wallet.chain_tip().unwrap();
        assert_eq!(tip_height, 10);
        assert_eq!(
            tip_hash,
            crate::chain::engine::tests::header_from_hex(crate::chain::engine::tests::CHAIN[9])
                .block_hash()
        );
    }

    #[tokio::test]
    async fn addresses_and_keys_round_trip() {
        let wallet = regtest_wallet().await;
        let current = wallet.current_address(KeyPurpose::External).await.unwrap();
        assert!(wallet.has_key(&current).await);
        assert!(!wallet.has_key(&foreign_address()).await);

        let fresh = wallet.new_address(KeyPurpose::External).await.unwrap();
        assert_ne!(current, fresh);
        let key = wallet.get_key(&fresh).await.unwrap();
        let secp = bitcoin::secp256k1::Secp256k1::new();
        assert_eq!(
            Address::p2pkh(key.public_key(&secp).pubkey_hash(), bitcoin::NetworkKind::Test),
            fresh
        );

        let addresses = wallet.list_addresses().await.unwrap();
        assert!(addresses.contains(&current));
        assert!(addresses.contains(&fresh));
        assert!(!wallet.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_moves_everything_to_destination() {
        let wallet = regtest_wallet().await;
        let funding = fund_wallet(&wallet, 100_000, 1).await;
        let coins = wallet.gather_coins().await;
        assert_eq!(coins.len(), 1);

        let key = coins[0].key;
        let inputs = vec![coins[0].utxo.clone()];
        let txid = wallet
            .sweep_address(inputs, Some(foreign_address()), key, None, FeeLevel::Economic)
            .await
            .unwrap();

        let record = wallet.get_transaction(&txid).await.unwrap();
        let raw: Transaction = deserialize(&record.raw).unwrap();
        assert_eq!(raw.input.len(), 1);
        assert_eq!(raw.input[0].previous_output.txid, funding.compute_txid());
        assert_eq!(raw.output.len(), 1);
        assert_eq!(raw.output[0].script_pubkey, foreign_address().script_pubkey());
        // All swept out: no wallet outputs remain.
        assert!(wallet.txstore.utxos().await.is_empty());
    }

    #[tokio::test]
    async fn multisig_setup_and_signing() {
        let wallet = regtest_wallet().await;
        let key1 = wallet.keys.derive_public_key(KeyPurpose::External, 0).unwrap();
        let key2 = wallet.keys.derive_public_key(KeyPurpose::External, 1).unwrap();
        let (address, redeem) = wallet.generate_multisig_script(&[key1, key2], 2).unwrap();
        assert!(address.script_pubkey().is_p2sh());

        let inputs = vec![OutPoint {
            txid: Txid::from_str(
                "6f7a58ad92702601fcbaac0e039943a384f5274a205c16bb8bbab54f9ea2fbad",
            )
            .unwrap(),
            vout: 0,
        }];
        let outputs = vec![TxOut {
            value: Amount::from_sat(90_000),
            script_pubkey: foreign_address().script_pubkey(),
        }];

        let sk1 = wallet.keys.derive_key(KeyPurpose::External, 0).unwrap();
        let sk2 = wallet.keys.derive_key(KeyPurpose::External, 1).unwrap();
        let sigs1 = wallet
            .create_multisig_signature(inputs.clone(), outputs.clone(), sk1, &redeem, 10)
            .await
            .unwrap();
        let sigs2 = wallet
            .create_multisig_signature(inputs.clone(), outputs.clone(), sk2, &redeem, 10)
            .await
            .unwrap();
        assert_eq!(sigs1.len(), 1);
        assert_eq!(sigs2.len(), 1);
        assert_ne!(sigs1[0].signature, sigs2[0].signature);

        let raw = wallet
            .multisign(inputs, outputs, sigs1, sigs2, &redeem, 10, false)
            .await
            .unwrap();
        let tx: Transaction = deserialize(&raw).unwrap();
        // OP_0, two signatures, and the redeem script in the scriptSig.
        let instructions: Vec<_> =
            tx.input[0].script_sig.instructions().collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(instructions.len(), 4);
    }

    #[tokio::test]
    async fn watched_script_hits_are_watch_only() {
        let wallet = regtest_wallet().await;
        let script =
            ScriptBuf::from_bytes(hex::decode("a914ac66e5ca929ded3d146c77ae988886050b1a8e5287").unwrap());
        wallet.add_watched_script(script.clone()).await.unwrap();

        let mut tx: Transaction = deserialize(&hex::decode(TX1_HEX).unwrap()).unwrap();
        tx.input.push(TxIn {
            previous_output: OutPoint {
                txid: Txid::from_str(
                    "a0d4cbcd8d0694e1132400b5e114b31bc3e0d8a2ac26e054f78727c95485b528",
                )
                .unwrap(),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
        tx.output.push(TxOut {
            value: Amount::from_sat(42_000),
            script_pubkey: script,
        });
        wallet.ingest_transaction(&tx, 0).await.unwrap();

        let record = wallet.get_transaction(&tx.compute_txid()).await.unwrap();
        assert!(record.watch_only);
        // Watch-only outputs are not spendable coins.
        assert!(wallet.gather_coins().await.is_empty());
    }

    #[tokio::test]
    async fn resync_rolls_wallet_state_back() {
        let wallet = regtest_wallet().await;
        fund_wallet(&wallet, 100_000, 5).await;
        assert_eq!(wallet.balance().await, (100_000, 0));

        wallet.resync(3).await.unwrap();
        assert_eq!(wallet.sync.sync_height(), 3);
        // The deposit at height 5 is rolled back until re-seen.
        assert_eq!(wallet.balance().await, (0, 0));
    }

    #[tokio::test]
    async fn dump_headers_writes_records() {
        let wallet = regtest_wallet().await;
        for hex_header in crate::chain::engine::tests::CHAIN.iter().take(2) {
            wallet
                .chain
                .commit_header(&crate::chain::engine::tests::header_from_hex(hex_header))
                .unwrap();
        }
        let mut out = Vec::new();
        wallet.dump_headers(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3); // checkpoint + two headers
        assert!(text.starts_with("Height: 0.0, Hash: "));
    }

    #[tokio::test]
    async fn listener_fires_on_spend() {
        let wallet = regtest_wallet().await;
        fund_wallet(&wallet, 100_000, 1).await;

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        wallet.add_transaction_listener(Box::new(move |event| {
            let _ = sender.send(event);
        }));

        let txid = wallet.spend(30_000, &foreign_address(), FeeLevel::Economic).await.unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.txid, txid);
        assert_eq!(event.height, 0);
        assert!(event.value < 0);
    }
}
