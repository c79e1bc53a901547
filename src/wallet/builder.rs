//! Coin selection, transaction construction and signing.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder as ScriptBuilder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, PrivateKey, PublicKey, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};

use crate::chain::Blockchain;
use crate::error::{BuilderError, BuilderResult};
use crate::fees::FeeProvider;
use crate::keys::KeyManager;
use crate::txstore::TxStore;
use crate::types::{FeeLevel, KeyPurpose, Utxo};

/// Outputs below this many satoshis are not worth creating.
pub const DUST_THRESHOLD: u64 = 546;

/// Size estimate of one signed P2PKH input.
const P2PKH_INPUT_SIZE: u64 = 148;

/// Size estimate of one P2PKH output.
const OUTPUT_SIZE: u64 = 34;

/// Fixed transaction overhead (version, counts, locktime).
const TX_OVERHEAD: u64 = 10;

/// A spendable output paired with its key.
#[derive(Clone)]
pub struct Coin {
    pub utxo: Utxo,
    pub key: PrivateKey,
    pub confirmations: u32,
}

/// One signature over one input of a multisig transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigSignature {
    pub input_index: u32,
    pub signature: Vec<u8>,
}

/// Builds and signs wallet transactions.
pub struct TxBuilder {
    chain: Arc<Blockchain>,
    txstore: Arc<TxStore>,
    keys: Arc<KeyManager>,
    fees: Arc<FeeProvider>,
    secp: Secp256k1<All>,
}

impl TxBuilder {
    pub fn new(
        chain: Arc<Blockchain>,
        txstore: Arc<TxStore>,
        keys: Arc<KeyManager>,
        fees: Arc<FeeProvider>,
    ) -> Self {
        Self {
            chain,
            txstore,
            keys,
            fees,
            secp: Secp256k1::new(),
        }
    }

    /// Every mature, unfrozen output the keychain can spend, with its key
    /// and confirmation count.
    pub async fn gather_coins(&self) -> Vec<Coin> {
        let tip = self.chain.height().unwrap_or(0);
        let mut coins = Vec::new();
        for utxo in self.txstore.utxos().await {
            if utxo.watch_only || utxo.frozen {
                continue;
            }
            let key = match self.keys.key_for_script(&utxo.script_pubkey).await {
                Ok(key) => key,
                Err(_) => continue,
            };
            let confirmations = if utxo.height > 0 && tip >= utxo.height {
                tip - utxo.height + 1
            } else {
                0
            };
            coins.push(Coin {
                utxo,
                key,
                confirmations,
            });
        }
        coins
    }

    /// Estimated serialized size of a P2PKH transaction.
    pub fn estimate_size(inputs: usize, outputs: usize) -> u64 {
        TX_OVERHEAD + P2PKH_INPUT_SIZE * inputs as u64 + OUTPUT_SIZE * outputs as u64
    }

    /// Fee for a transaction of the given shape at the given rate.
    pub fn estimate_fee(inputs: usize, outputs: usize, fee_per_byte: u64) -> u64 {
        Self::estimate_size(inputs, outputs) * fee_per_byte
    }

    /// Build, sign and return a payment of `amount` to `to`. The caller
    /// ingests and broadcasts the result.
    pub async fn spend(
        &self,
        amount: u64,
        to: &Address,
        fee_level: FeeLevel,
    ) -> BuilderResult<Transaction> {
        let fee_per_byte = self.fees.fee_per_byte(fee_level).await;
        let mut coins = self.gather_coins().await;
        coins.sort_by(|a, b| b.utxo.value.cmp(&a.utxo.value));

        // Fee depends on input count, so selection is a fixed point.
        let mut selected: Vec<Coin> = Vec::new();
        let mut total = 0u64;
        let mut fee = 0u64;
        let mut funded = false;
        for coin in coins {
            total += coin.utxo.value.to_sat();
            selected.push(coin);
            fee = Self::estimate_fee(selected.len(), 2, fee_per_byte);
            if total >= amount.saturating_add(fee) {
                funded = true;
                break;
            }
        }
        if !funded {
            return Err(BuilderError::InsufficientFunds);
        }
        if fee > amount {
            return Err(BuilderError::FeeExceedsMax);
        }

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: to.script_pubkey(),
        }];
        let change = total - amount - fee;
        if change >= DUST_THRESHOLD {
            let change_addr = self.keys.fresh_address(KeyPurpose::Internal).await?;
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_addr.script_pubkey(),
            });
        }
        // Sub-dust change folds into the fee.

        self.build_signed(&selected, outputs)
    }

    /// Re-spend the inputs of an unconfirmed transaction at the bump rate,
    /// paying the same foreign recipients. The original must still be
    /// replaceable: unconfirmed, and none of its inputs spent elsewhere.
    pub async fn bump_fee(&self, txid: Txid) -> BuilderResult<Transaction> {
        let record = self
            .txstore
            .transaction(&txid)
            .await
            .map_err(|_| BuilderError::NotFound(txid.to_string()))?;
        if record.height != 0 {
            return Err(BuilderError::UnconfirmedInputsForBump);
        }
        let old: Transaction = bitcoin::consensus::deserialize(&record.raw)
            .map_err(|e| BuilderError::Signing(format!("stored tx undecodable: {}", e)))?;

        // Every input must still be spent by the original and nothing else.
        let stxos = self.txstore.stxos().await;
        let spent_by_original: HashMap<OutPoint, Utxo> = stxos
            .iter()
            .filter(|s| s.spend_txid == txid)
            .map(|s| (s.utxo.outpoint, s.utxo.clone()))
            .collect();
        for input in &old.input {
            match spent_by_original.get(&input.previous_output) {
                Some(_) => {}
                None => return Err(BuilderError::UnconfirmedInputsForBump),
            }
        }

        let recipients: Vec<TxOut> = {
            let mut foreign = Vec::new();
            for output in &old.output {
                if !self.keys.has_script(&output.script_pubkey).await {
                    foreign.push(output.clone());
                }
            }
            foreign
        };

        // Kill the original; its inputs return to the UTXO table for the
        // replacement to pick up.
        self.txstore
            .mark_as_dead(txid)
            .await
            .map_err(|e| BuilderError::Signing(format!("mark dead: {}", e)))?;

        let fee_per_byte = self.fees.fee_per_byte(FeeLevel::FeeBump).await;
        let mut inputs = Vec::new();
        let mut total = 0u64;
        for (outpoint, utxo) in spent_by_original {
            let key = self.keys.key_for_script(&utxo.script_pubkey).await?;
            total += utxo.value.to_sat();
            inputs.push(Coin {
                utxo: Utxo {
                    outpoint,
                    ..utxo
                },
                key,
                confirmations: 0,
            });
        }

        let paying: u64 = recipients.iter().map(|o| o.value.to_sat()).sum();
        let fee = Self::estimate_fee(inputs.len(), recipients.len() + 1, fee_per_byte);
        if total < paying.saturating_add(fee) {
            return Err(BuilderError::InsufficientFunds);
        }

        let mut outputs = recipients;
        let change = total - paying - fee;
        if change >= DUST_THRESHOLD {
            let change_addr = self.keys.fresh_address(KeyPurpose::Internal).await?;
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_addr.script_pubkey(),
            });
        }
        if outputs.is_empty() {
            return Err(BuilderError::FeeExceedsMax);
        }

        self.build_signed(&inputs, outputs)
    }

    /// Move the listed outputs to `dest` (or a fresh internal address) in
    /// one transaction signed with the supplied key. With a redeem script
    /// the inputs are treated as P2SH and signed on its branch.
    pub async fn sweep(
        &self,
        inputs: Vec<Utxo>,
        dest: Option<Address>,
        key: PrivateKey,
        redeem_script: Option<ScriptBuf>,
        fee_level: FeeLevel,
    ) -> BuilderResult<Transaction> {
        if inputs.is_empty() {
            return Err(BuilderError::InsufficientFunds);
        }
        let fee_per_byte = self.fees.fee_per_byte(fee_level).await;
        let total: u64 = inputs.iter().map(|u| u.value.to_sat()).sum();
        let input_size = match &redeem_script {
            Some(redeem) => p2sh_input_size(redeem),
            None => P2PKH_INPUT_SIZE,
        };
        let fee = (TX_OVERHEAD + input_size * inputs.len() as u64 + OUTPUT_SIZE) * fee_per_byte;
        if fee >= total {
            return Err(BuilderError::FeeExceedsMax);
        }

        let dest_script = match dest {
            Some(addr) => addr.script_pubkey(),
            None => self.keys.fresh_address(KeyPurpose::Internal).await?.script_pubkey(),
        };
        let output = TxOut {
            value: Amount::from_sat(total - fee),
            script_pubkey: dest_script,
        };

        let mut tx = unsigned_transaction(
            inputs.iter().map(|u| u.outpoint).collect(),
            vec![output],
        );
        sort_bip69(&mut tx);

        let pubkey = key.public_key(&self.secp);
        let mut script_sigs = Vec::with_capacity(tx.input.len());
        {
            let cache = SighashCache::new(&tx);
            for (i, input) in tx.input.iter().enumerate() {
                let utxo = inputs
                    .iter()
                    .find(|u| u.outpoint == input.previous_output)
                    .ok_or_else(|| BuilderError::Signing("input lost in sort".into()))?;
                let script_sig = match &redeem_script {
                    Some(redeem) => {
                        let sig = self.sign_input(&cache, i, redeem, &key)?;
                        ScriptBuilder::new()
                            .push_slice(push_bytes(sig)?)
                            .push_slice(push_bytes(redeem.to_bytes())?)
                            .into_script()
                    }
                    None => {
                        let sig = self.sign_input(&cache, i, &utxo.script_pubkey, &key)?;
                        ScriptBuilder::new()
                            .push_slice(push_bytes(sig)?)
                            .push_key(&pubkey)
                            .into_script()
                    }
                };
                script_sigs.push(script_sig);
            }
        }
        for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        Ok(tx)
    }

    /// Produce one signature per input for an M-of-N spend; nothing is
    /// broadcast.
    pub async fn create_multisig_signature(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        key: PrivateKey,
        redeem_script: &ScriptBuf,
        fee_per_byte: u64,
    ) -> BuilderResult<Vec<MultisigSignature>> {
        let tx = multisig_skeleton(inputs, outputs, redeem_script, fee_per_byte)?;
        let cache = SighashCache::new(&tx);
        let mut signatures = Vec::with_capacity(tx.input.len());
        for i in 0..tx.input.len() {
            let signature = self.sign_input(&cache, i, redeem_script, &key)?;
            signatures.push(MultisigSignature {
                input_index: i as u32,
                signature,
            });
        }
        Ok(signatures)
    }

    /// Combine two signature sets into a complete M-of-2 transaction.
    pub async fn multisign(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        sigs1: Vec<MultisigSignature>,
        sigs2: Vec<MultisigSignature>,
        redeem_script: &ScriptBuf,
        fee_per_byte: u64,
    ) -> BuilderResult<Transaction> {
        let mut tx = multisig_skeleton(inputs, outputs, redeem_script, fee_per_byte)?;
        for (i, input) in tx.input.iter_mut().enumerate() {
            let sig1 = sigs1
                .iter()
                .find(|s| s.input_index == i as u32)
                .ok_or_else(|| BuilderError::Signing(format!("missing signature for input {}", i)))?;
            let sig2 = sigs2
                .iter()
                .find(|s| s.input_index == i as u32)
                .ok_or_else(|| BuilderError::Signing(format!("missing signature for input {}", i)))?;
            // Leading OP_0 absorbs the historical CHECKMULTISIG pop.
            input.script_sig = ScriptBuilder::new()
                .push_int(0)
                .push_slice(push_bytes(sig1.signature.clone())?)
                .push_slice(push_bytes(sig2.signature.clone())?)
                .push_slice(push_bytes(redeem_script.to_bytes())?)
                .into_script();
        }
        Ok(tx)
    }

    /// M-of-N redeem script and its P2SH address.
    pub fn generate_multisig_script(
        &self,
        keys: &[PublicKey],
        threshold: usize,
    ) -> BuilderResult<(Address, ScriptBuf)> {
        if threshold == 0 || threshold > keys.len() {
            return Err(BuilderError::Signing(format!(
                "invalid threshold {} of {}",
                threshold,
                keys.len()
            )));
        }
        let mut builder = ScriptBuilder::new().push_int(threshold as i64);
        for key in keys {
            builder = builder.push_key(key);
        }
        let redeem = builder
            .push_int(keys.len() as i64)
            .push_opcode(bitcoin::opcodes::all::OP_CHECKMULTISIG)
            .into_script();
        let address = Address::p2sh(&redeem, bitcoin::NetworkKind::from(self.chain.params().network))
            .map_err(|e| BuilderError::Signing(format!("redeem script too large: {}", e)))?;
        Ok((address, redeem))
    }

    /// Assemble and sign a P2PKH transaction over the selected coins.
    fn build_signed(&self, coins: &[Coin], outputs: Vec<TxOut>) -> BuilderResult<Transaction> {
        let by_outpoint: HashMap<OutPoint, &Coin> =
            coins.iter().map(|c| (c.utxo.outpoint, c)).collect();
        let mut tx =
            unsigned_transaction(coins.iter().map(|c| c.utxo.outpoint).collect(), outputs);
        sort_bip69(&mut tx);

        let mut script_sigs = Vec::with_capacity(tx.input.len());
        {
            let cache = SighashCache::new(&tx);
            for (i, input) in tx.input.iter().enumerate() {
                let coin = by_outpoint
                    .get(&input.previous_output)
                    .ok_or_else(|| BuilderError::Signing("input lost in sort".into()))?;
                let sig = self.sign_input(&cache, i, &coin.utxo.script_pubkey, &coin.key)?;
                let pubkey = coin.key.public_key(&self.secp);
                script_sigs.push(
                    ScriptBuilder::new()
                        .push_slice(push_bytes(sig)?)
                        .push_key(&pubkey)
                        .into_script(),
                );
            }
        }
        for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        Ok(tx)
    }

    /// DER signature with the SIGHASH_ALL byte appended.
    fn sign_input(
        &self,
        cache: &SighashCache<&Transaction>,
        index: usize,
        script: &ScriptBuf,
        key: &PrivateKey,
    ) -> BuilderResult<Vec<u8>> {
        let sighash = cache
            .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
            .map_err(|e| BuilderError::Signing(format!("sighash: {}", e)))?;
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = self.secp.sign_ecdsa(&message, &key.inner);
        let mut bytes = signature.serialize_der().to_vec();
        bytes.push(EcdsaSighashType::All.to_u32() as u8);
        Ok(bytes)
    }
}

fn push_bytes(bytes: Vec<u8>) -> BuilderResult<PushBytesBuf> {
    PushBytesBuf::try_from(bytes)
        .map_err(|e| BuilderError::Signing(format!("push too large: {}", e)))
}

fn unsigned_transaction(outpoints: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: outpoints
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                // Signal replaceability so a later fee bump is honored.
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

/// Deterministic input/output ordering. Inputs sort by reversed txid bytes
/// then index; outputs by value then script bytes.
fn sort_bip69(tx: &mut Transaction) {
    tx.input.sort_by(|a, b| {
        let mut a_txid = a.previous_output.txid.to_byte_array();
        let mut b_txid = b.previous_output.txid.to_byte_array();
        a_txid.reverse();
        b_txid.reverse();
        match a_txid.cmp(&b_txid) {
            Ordering::Equal => a.previous_output.vout.cmp(&b.previous_output.vout),
            ord => ord,
        }
    });
    tx.output.sort_by(|a, b| match a.value.cmp(&b.value) {
        Ordering::Equal => a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()),
        ord => ord,
    });
}

/// Per-input size estimate for a 2-of-3 style P2SH spend.
fn p2sh_input_size(redeem: &ScriptBuf) -> u64 {
    // outpoint + sequence + script length prefix, two signatures, OP_0,
    // and the redeem script itself.
    42 + 2 * 73 + redeem.len() as u64
}

/// Unsigned multisig spend: inputs as given, fee deducted evenly from the
/// outputs.
fn multisig_skeleton(
    inputs: Vec<OutPoint>,
    mut outputs: Vec<TxOut>,
    redeem_script: &ScriptBuf,
    fee_per_byte: u64,
) -> BuilderResult<Transaction> {
    if inputs.is_empty() || outputs.is_empty() {
        return Err(BuilderError::InsufficientFunds);
    }
    let size = TX_OVERHEAD
        + p2sh_input_size(redeem_script) * inputs.len() as u64
        + OUTPUT_SIZE * outputs.len() as u64;
    let fee_share = size * fee_per_byte / outputs.len() as u64;
    for output in &mut outputs {
        let value = output.value.to_sat();
        if value <= fee_share {
            return Err(BuilderError::FeeExceedsMax);
        }
        output.value = Amount::from_sat(value - fee_share);
    }
    let mut tx = unsigned_transaction(inputs, outputs);
    sort_bip69(&mut tx);
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;

    #[test]
    fn size_estimate_matches_p2pkh_arithmetic() {
        assert_eq!(TxBuilder::estimate_size(1, 2), 10 + 148 + 68);
        assert_eq!(TxBuilder::estimate_fee(2, 2, 10), (10 + 296 + 68) * 10);
    }

    #[test]
    fn bip69_orders_inputs_and_outputs() {
        let txid_a =
            Txid::from_byte_array([0xee; 32]);
        let txid_b =
            Txid::from_byte_array([0x11; 32]);
        let mut tx = unsigned_transaction(
            vec![
                OutPoint {
                    txid: txid_a,
                    vout: 1,
                },
                OutPoint {
                    txid: txid_a,
                    vout: 0,
                },
                OutPoint {
                    txid: txid_b,
                    vout: 5,
                },
            ],
            vec![
                TxOut {
                    value: Amount::from_sat(900),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                },
                TxOut {
                    value: Amount::from_sat(100),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x52]),
                },
                TxOut {
                    value: Amount::from_sat(100),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                },
            ],
        );
        sort_bip69(&mut tx);

        assert_eq!(tx.input[0].previous_output.txid, txid_b);
        assert_eq!(tx.input[1].previous_output, OutPoint {
            txid: txid_a,
            vout: 0,
        });
        assert_eq!(tx.input[2].previous_output, OutPoint {
            txid: txid_a,
            vout: 1,
        });

        assert_eq!(tx.output[0].value, Amount::from_sat(100));
        assert_eq!(tx.output[0].script_pubkey.as_bytes(), &[0x51]);
        assert_eq!(tx.output[1].value, Amount::from_sat(100));
        assert_eq!(tx.output[1].script_pubkey.as_bytes(), &[0x52]);
        assert_eq!(tx.output[2].value, Amount::from_sat(900));
    }

    #[test]
    fn multisig_skeleton_deducts_fee_evenly() {
        let redeem = ScriptBuf::from_bytes(vec![0x52; 71]);
        let inputs = vec![OutPoint {
            txid: Txid::from_byte_array([1; 32]),
            vout: 0,
        }];
        let outputs = vec![
            TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            },
            TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x52]),
            },
        ];
        let tx = multisig_skeleton(inputs, outputs, &redeem, 10).unwrap();
        let size = TX_OVERHEAD + p2sh_input_size(&redeem) + OUTPUT_SIZE * 2;
        let share = size * 10 / 2;
        assert!(tx.output.iter().all(|o| o.value.to_sat() == 100_000 - share));
    }

    #[test]
    fn multisig_skeleton_rejects_unpayable_fee() {
        let redeem = ScriptBuf::from_bytes(vec![0x52; 71]);
        let inputs = vec![OutPoint {
            txid: Txid::from_byte_array([1; 32]),
            vout: 0,
        }];
        let outputs = vec![TxOut {
            value: Amount::from_sat(10),
            script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
        }];
        assert!(matches!(
            multisig_skeleton(inputs, outputs, &redeem, 10),
            Err(BuilderError::FeeExceedsMax)
        ));
    }
}
