//! BIP44 hierarchical-deterministic key management.
//!
//! Two derivation chains hang off `m/44'/coin'/0'`: external (receive)
//! and internal (change). A lookahead window of unused keys is kept ahead
//! of the highest used index on each chain so that restoring from seed
//! finds transactions paid to never-handed-out addresses. Single-key
//! imports live at the sentinel index -1.

use std::sync::Arc;

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, NetworkKind, PrivateKey, PublicKey, Script, ScriptBuf};

use crate::chain::NetworkParams;
use crate::error::{KeychainError, KeychainResult, StoreError};
use crate::store::WalletStore;
use crate::types::{KeyPath, KeyPurpose};

/// Number of unused keys kept ahead of the highest used index, per chain.
pub const LOOKAHEAD_WINDOW: u32 = 20;

/// Derives, persists and looks up wallet keys.
pub struct KeyManager {
    store: Arc<dyn WalletStore>,
    params: NetworkParams,
    secp: Secp256k1<All>,
    master: Xpriv,
    external: Xpriv,
    internal: Xpriv,
}

impl KeyManager {
    /// Build the BIP44 chains and fill the initial lookahead window.
    /// Derivation failure here is fatal to wallet construction.
    pub async fn new(
        store: Arc<dyn WalletStore>,
        params: NetworkParams,
        master: Xpriv,
    ) -> KeychainResult<Self> {
        let secp = Secp256k1::new();
        let account = master.derive_priv(
            &secp,
            &[
                ChildNumber::from_hardened_idx(44)?,
                ChildNumber::from_hardened_idx(params.coin_type)?,
                ChildNumber::from_hardened_idx(0)?,
            ],
        )?;
        let external = account.derive_priv(&secp, &[ChildNumber::from_normal_idx(0)?])?;
        let internal = account.derive_priv(&secp, &[ChildNumber::from_normal_idx(1)?])?;

        let manager = Self {
            store,
            params,
            secp,
            master,
            external,
            internal,
        };
        manager.extend_lookahead().await?;
        Ok(manager)
    }

    pub fn master_private_key(&self) -> Xpriv {
        self.master
    }

    pub fn master_public_key(&self) -> Xpub {
        Xpub::from_priv(&self.secp, &self.master)
    }

    fn network_kind(&self) -> NetworkKind {
        NetworkKind::from(self.params.network)
    }

    /// Derive the private key at `purpose/index`.
    pub fn derive_key(&self, purpose: KeyPurpose, index: u32) -> KeychainResult<PrivateKey> {
        let chain = match purpose {
            KeyPurpose::External => &self.external,
            KeyPurpose::Internal => &self.internal,
        };
        let child = chain.derive_priv(&self.secp, &[ChildNumber::from_normal_idx(index)?])?;
        Ok(child.to_priv())
    }

    /// P2PKH address for the key at `purpose/index`.
    pub fn derive_address(&self, purpose: KeyPurpose, index: u32) -> KeychainResult<Address> {
        let key = self.derive_key(purpose, index)?;
        let pubkey = key.public_key(&self.secp);
        Ok(Address::p2pkh(pubkey.pubkey_hash(), self.network_kind()))
    }

    /// P2PKH scriptPubKey for the key at `purpose/index`.
    pub fn derive_script(&self, purpose: KeyPurpose, index: u32) -> KeychainResult<ScriptBuf> {
        let key = self.derive_key(purpose, index)?;
        let pubkey = key.public_key(&self.secp);
        Ok(ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()))
    }

    /// Key at the lowest unused index for the purpose.
    pub async fn current_key(&self, purpose: KeyPurpose) -> KeychainResult<(u32, PrivateKey)> {
        let unused = self.store.keys().unused(purpose).await?;
        let index = unused.first().copied().unwrap_or(0).max(0) as u32;
        Ok((index, self.derive_key(purpose, index)?))
    }

    /// Address at the lowest unused index for the purpose.
    pub async fn current_address(&self, purpose: KeyPurpose) -> KeychainResult<Address> {
        let (index, _) = self.current_key(purpose).await?;
        self.derive_address(purpose, index)
    }

    /// Generate and persist the key one past the highest stored index.
    /// Marking it as used is the caller's responsibility; the ingest
    /// pipeline is the normal caller.
    pub async fn fresh_key(&self, purpose: KeyPurpose) -> KeychainResult<(u32, PrivateKey)> {
        let index = match self.store.keys().last_index(purpose).await? {
            Some((last, _)) => (last + 1).max(0) as u32,
            None => 0,
        };
        let script = self.derive_script(purpose, index)?;
        self.store.keys().put(&script, KeyPath::new(purpose, index as i32)).await?;
        Ok((index, self.derive_key(purpose, index)?))
    }

    /// Fresh address on the purpose chain.
    pub async fn fresh_address(&self, purpose: KeyPurpose) -> KeychainResult<Address> {
        let (index, _) = self.fresh_key(purpose).await?;
        self.derive_address(purpose, index)
    }

    /// Flag the key behind `script` as used and refill the lookahead.
    pub async fn mark_used(&self, script: &Script) -> KeychainResult<()> {
        self.store.keys().mark_used(script).await?;
        self.extend_lookahead().await
    }

    /// Ensure at least `LOOKAHEAD_WINDOW` unused keys exist per purpose
    /// beyond the highest used index.
    pub async fn extend_lookahead(&self) -> KeychainResult<()> {
        let windows = self.store.keys().lookahead_windows().await?;
        for purpose in [KeyPurpose::External, KeyPurpose::Internal] {
            let unused = windows.get(&purpose).copied().unwrap_or(0);
            if unused >= LOOKAHEAD_WINDOW {
                continue;
            }
            let mut next = match self.store.keys().last_index(purpose).await? {
                Some((last, _)) => (last + 1).max(0) as u32,
                None => 0,
            };
            for _ in unused..LOOKAHEAD_WINDOW {
                let script = self.derive_script(purpose, next)?;
                self.store.keys().put(&script, KeyPath::new(purpose, next as i32)).await?;
                next += 1;
            }
            tracing::debug!(%purpose, generated = LOOKAHEAD_WINDOW - unused, "Extended key lookahead");
        }
        Ok(())
    }

    /// Store a single key at the sentinel path. Accepts WIF or raw hex.
    pub async fn import_key(&self, encoded: &str) -> KeychainResult<Address> {
        let key = match PrivateKey::from_wif(encoded) {
            Ok(key) => key,
            Err(_) => {
                let bytes = hex::decode(encoded)
                    .map_err(|_| KeychainError::InvalidKeyFormat(encoded.into()))?;
                PrivateKey::from_slice(&bytes, self.network_kind())
                    .map_err(|_| KeychainError::InvalidKeyFormat(encoded.into()))?
            }
        };
        let pubkey = key.public_key(&self.secp);
        let script = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
        self.store.keys().import_key(&script, key).await?;
        Ok(Address::p2pkh(pubkey.pubkey_hash(), self.network_kind()))
    }

    /// Private key able to spend `script`, derived or imported.
    pub async fn key_for_script(&self, script: &Script) -> KeychainResult<PrivateKey> {
        match self.store.keys().path_for_script(script).await {
            Ok(path) => self.derive_key(path.purpose, path.index as u32),
            Err(StoreError::NotFound(_)) => self
                .store
                .keys()
                .key_for_script(script)
                .await
                .map_err(|_| KeychainError::KeyNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the wallet can spend `script`.
    pub async fn has_script(&self, script: &Script) -> bool {
        self.key_for_script(script).await.is_ok()
    }

    /// Every stored script with its path, for the matcher's address index.
    pub async fn all_scripts(&self) -> KeychainResult<Vec<(ScriptBuf, KeyPath)>> {
        Ok(self.store.keys().all_scripts().await?)
    }

    /// Compressed public key for a derived slot, used by multisig setup.
    pub fn derive_public_key(&self, purpose: KeyPurpose, index: u32) -> KeychainResult<PublicKey> {
        Ok(self.derive_key(purpose, index)?.public_key(&self.secp))
    }
}
