//! Header chain scenarios: fresh sync and a reorganization that unwinds
//! wallet state.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::bip32::Xpriv;
use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::deserialize;
use bitcoin::{Amount, Network, Transaction, TxOut};

use spv_wallet::chain::{Blockchain, MemoryHeaderStore, NetworkParams};
use spv_wallet::store::MemoryWalletStore;
use spv_wallet::{KeyManager, KeyPurpose, TxStore};

const FIXTURE_XPRV: &str = "xprv9s21ZrQH143K25QhxbucbDDuQ4naNntJRi4KUfWT7xo4EKsHt2QJDu7KXp1A3u7Bi1j8ph3EGsZ9Xvz9dGuVrtHHs7pXeTzjuxBrCmmhgC6";

const TX1_HEX: &str = "0100000001f0c1a0d39f0f1357fcead5897f1eed424d9835d30d2543f3d804138ba825939b010000006b483045022100ed5c193377e4fb7d8df067c18e4982f55f2443cd9b41548347f646448cc5ad9f02202ad6ad5041246a23868bc52675c4c1a4018e1cfd180dcd63897fb9040df14d85012102e2606d87535c7b15855a854c09225ba025230f8b79332a6d1d06b39cd711f821ffffffff0264f3cc03000000001976a9148f83a59ebdf80b8cc965a28da3a825c126a4cefb88ac204e0000000000001976a9140706d0505002aa3ef07a822b9c143b0047b07bdf88ac00000000";

/// New chain starting from the regtest genesis.
const CHAIN: [&str; 10] = [
    "0000002006226e46111a0b59caaf126043eb5bbf28c34f3a5e332a1fc7b2b73cf188910fc3ed4523bf94fc1fa184bee85af604c9ebeea6b39b498f62703fd3f03e7475534658d158ffff7f2001000000",
    "000000207c3d2d417ff34a46f4f11a972d8e32bc98b300112dd4d9a1dae9ff87468eae136b90f1757adfab2056d693160b417b8f87a65c2c0735a47e63768f26473905506059d158ffff7f2003000000",
    "000000200c6ea2eaf928b2d5d080c2f36dac1185865db1289c7339834b98e8034e4274073ed977491ebe6f9c0e01f5796e36ed66bf4e410bbbc2635129d6e0ecfc1897908459d158ffff7f2001000000",
    "000000202e1569563ff6463f65bb7669b35fb9dd95ba0b251e30251b9877d9578b8700680337ff38b71d9667190c99e8fae337ba8c9c40cbd2c4678ba71d81cf6d3a1aa2ac59d158ffff7f2001000000",
    "000000204525edcccf706e3769a54c8772934f291d6810315a26c177862c66feb9f3896e090c84be811cfdfed6da043cb337fccecff95fc73810ca82adb3d032b5d49140c759d158ffff7f2000000000",
    "00000020ada1a9efa81df10d7b430e2fd5f3b085180c91b0e9b0f6e9af2d9b733544015eab404ef503e538909a04a419499133af9bcee47fcfc84baaab5344f77ebd455dec59d158ffff7f2000000000",
    "000000204fdcb9ca4cc47ae7485bfc2f8adcbd515b1ee0cb724d343c91f02b6ec5a0ba507dddd2639fc1bd522489a2c2f2b681a60c6c7939490458dc1c008f3217cb47d6035ad158ffff7f2001000000",
    "0000002019dbc9a6cec93be207053e4dfbc63af20c3cedba68f890c5a90f27aeb2ecc73386692b64e16ea4b87fc877cb3762394d12b597a0ca8d5efb2ea2c6e163f9e4c8225ad158ffff7f2000000000",
    "000000203afc4a1c100fe3e21fa24ef92857613bb00890564e3529623780bc8d4a86d15cfd35aef39950dc53c348b5013f4ee3d94afc16745d6b3c8a9e6acfb8a2641c6f3e5ad158ffff7f2000000000",
    "000000200e1b58feab56f9fe5ed7484a8c7bfecdb270da528db7a805d18208891bde3726a5ccb0a073d0cc7402ac89f4bb4b64c39bc365bfee7ccd7ea3a24996ee684c775a5ad158ffff7f2000000000",
];

/// Forks `CHAIN` starting at block 6.
const FORK: [&str; 7] = [
    "00000020ada1a9efa81df10d7b430e2fd5f3b085180c91b0e9b0f6e9af2d9b733544015eead915a2f4521c58cb1c42a469aefede5a9d1dddfe8ccc408f8135fc2560f25a096dd158ffff7f20e9aace03",
    "0000002097e3603b40c0c7add951e3a7dba5088836d17e1123ef7cffdd60174e3dce0024cffe0c74189d854a778a3e57fee8510103e83d95b221b8bfe1159806b3bde27e236dd158ffff7f20794caff6",
    "0000002085a3bf0898ed1cad9e868120c8e044673425a13ecc7ab2daec204ca9190e643ca32434566054789e79214a7cb7c1b6e37084cbfce7564d4aabb10ef6fc1d655c3d6dd158ffff7f20c2e4cb6f",
    "000000209aa626e76fbcfc08bc1626a0a9bc7b82d8521de22a477e7b377d8f83be8d446a05aae352ffe9f09af1d79d24992dbee2785b3fe4eb4a0e21e7a3b26a90115dac536dd158ffff7f201d2f76eb",
    "000000208d6d636589b4056d1486fbcc0b46adefbb770b7e6a8d668fe65c3f58f5c2c70934008f98664ffec01f583870f843b617c869ec30f1b37723b3d0f0d4a3ba6a88686dd158ffff7f209d12ee06",
    "0000002067cf05afedc2b5956c10845006358fe480893e1199a0c0e2b70d5ecf2787af760385ca3d191d1800cd7b6a56d8b44853109f3e5983a94c7e10818541278ec6027b6dd158ffff7f2004e2c75c",
    "00000020b2227c6c858a36af167d9667dcf4f58df604ab7962a660d69d233a63e7269f06ecb669fff090b7f2f6952d52c96ca0c8abe1e266d9740f8548eeb10eea9e3536906dd158ffff7f20c0ac3d1e",
];

fn header(hex_header: &str) -> BlockHeader {
    deserialize(&hex::decode(hex_header).unwrap()).unwrap()
}

fn regtest_chain() -> Blockchain {
    let params = NetworkParams::for_network(Network::Regtest);
    Blockchain::new(Box::new(MemoryHeaderStore::new()), params).unwrap()
}

async fn matcher() -> (Arc<KeyManager>, TxStore) {
    let params = NetworkParams::for_network(Network::Regtest);
    let store = Arc::new(MemoryWalletStore::new());
    let master = Xpriv::from_str(FIXTURE_XPRV).unwrap();
    let keys = Arc::new(KeyManager::new(store.clone(), params.clone(), master).await.unwrap());
    let txstore = TxStore::new(params, store, keys.clone()).await.unwrap();
    (keys, txstore)
}

#[test]
fn fresh_chain_syncs_to_height_10() {
    let chain = regtest_chain();
    for (i, hex_header) in CHAIN.iter().enumerate() {
        let result = chain.commit_header(&header(hex_header)).unwrap();
        assert!(result.new_tip);
        assert!(result.reorg.is_none());
        assert_eq!(result.height, i as u32 + 1);
    }
    let best = chain.best_header().unwrap();
    assert_eq!(best.height, 10);
    assert_eq!(best.block_hash(), header(CHAIN[9]).block_hash());
}

#[tokio::test]
async fn reorg_marks_displaced_transactions_dead() {
    let chain = regtest_chain();
    for hex_header in CHAIN {
        chain.commit_header(&header(hex_header)).unwrap();
    }

    // Wallet deposits confirmed at heights 6 through 10.
    let (keys, txstore) = matcher().await;
    let mut txids = Vec::new();
    for (i, height) in (6u32..=10).enumerate() {
        let mut tx: Transaction = deserialize(&hex::decode(TX1_HEX).unwrap()).unwrap();
        tx.input[0].previous_output.vout = height;
        tx.output.push(TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: keys.derive_script(KeyPurpose::External, i as u32).unwrap(),
        });
        txstore.ingest(&tx, height, height as u64).await.unwrap();
        txids.push(tx.compute_txid());
    }
    assert_eq!(txstore.utxos().await.len(), 5);

    // Commit the heavier fork; the tip switches at the eleventh header.
    let mut fork_height = None;
    for (i, hex_header) in FORK.iter().enumerate() {
        let result = chain.commit_header(&header(hex_header)).unwrap();
        let height = i as u32 + 6;
        assert_eq!(result.height, height);
        if height == 11 {
            assert!(result.new_tip);
            fork_height = result.reorg.map(|r| r.fork_height);
        }
    }
    assert_eq!(fork_height, Some(5));
    assert_eq!(chain.best_header().unwrap().height, 12);

    // Roll the wallet back past the fork: every deposit above height 5
    // dies until the new chain re-confirms it.
    txstore.process_reorg(fork_height.unwrap()).await.unwrap();
    for txid in &txids {
        assert!(txstore.transaction(txid).await.unwrap().is_dead());
    }
    assert!(txstore.utxos().await.is_empty());
}

#[tokio::test]
async fn filter_refresh_signalled_when_window_extends() {
    let (keys, txstore) = matcher().await;
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    txstore.set_filter_refresh(sender);

    // A payment landing on the last unused external key extends the
    // lookahead to index 39 and forces a filter rebuild.
    let mut tx: Transaction = deserialize(&hex::decode(TX1_HEX).unwrap()).unwrap();
    tx.output.push(TxOut {
        value: Amount::from_sat(10_000),
        script_pubkey: keys.derive_script(KeyPurpose::External, 19).unwrap(),
    });
    txstore.ingest(&tx, 1, 1).await.unwrap();

    assert!(receiver.try_recv().is_ok(), "filter refresh must be requested");

    let filter = txstore.bloom_filter().await;
    // Newly minted window keys are already in the rebuilt filter.
    let script = keys.derive_script(KeyPurpose::External, 39).unwrap();
    let hash160 = &script.as_bytes()[3..23];
    assert!(filter.contains(hash160));
    // So is the deposit outpoint.
    let outpoint = bitcoin::OutPoint {
        txid: tx.compute_txid(),
        vout: 2,
    };
    assert!(filter.contains_outpoint(&outpoint));
}
