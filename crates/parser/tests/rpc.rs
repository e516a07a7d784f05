use std::collections::HashMap;
use std::path::Path;

use chainscan_parser::address::AddressState;
use chainscan_parser::rpc::{RpcBlock, RpcSource};
use chainscan_parser::utxo::UtxoState;
use chainscan_parser::{Error, Parser, ParserConfig};
use chainscan_primitives::block::BlockHeader;
use chainscan_primitives::encoding::Encoder;
use chainscan_primitives::hash::sha256d;
use chainscan_primitives::script::AddressType;
use chainscan_primitives::{Hash256, NULL_HASH};
use chainscan_store::ChainAccess;

#[derive(Default)]
struct FakeRpc {
    hashes: Vec<Hash256>,
    blocks: HashMap<Hash256, RpcBlock>,
    raw: HashMap<Hash256, Vec<u8>>,
}

impl FakeRpc {
    fn push_block(&mut self, header: BlockHeader, txs: &[(Hash256, Vec<u8>)]) -> Hash256 {
        let hash = header.hash();
        let size: usize = 80 + txs.iter().map(|(_, bytes)| bytes.len()).sum::<usize>();
        self.blocks.insert(
            hash,
            RpcBlock {
                hash,
                header,
                size: size as u32,
                tx_ids: txs.iter().map(|(txid, _)| *txid).collect(),
            },
        );
        for (txid, bytes) in txs {
            self.raw.insert(*txid, bytes.clone());
        }
        self.hashes.push(hash);
        hash
    }
}

impl RpcSource for FakeRpc {
    fn block_count(&self) -> Result<u32, Error> {
        Ok(self.hashes.len() as u32)
    }

    fn block_hash(&self, height: u32) -> Result<Hash256, Error> {
        self.hashes
            .get(height as usize)
            .copied()
            .ok_or_else(|| Error::Rpc(format!("no block at height {height}")))
    }

    fn block(&self, hash: &Hash256) -> Result<RpcBlock, Error> {
        self.blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::Rpc("unknown block hash".to_string()))
    }

    fn raw_transaction(&self, txid: &Hash256) -> Result<Vec<u8>, Error> {
        self.raw
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::Rpc("unknown transaction".to_string()))
    }
}

fn header(prev: Hash256, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: prev,
        merkle_root: [0u8; 32],
        time: 1_400_000_000 + nonce,
        bits: 0x1d00ffff,
        nonce,
    }
}

fn coinbase_paying(tag: u8, height_tag: u8) -> (Hash256, Vec<u8>) {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);

    let mut encoder = Encoder::new();
    encoder.write_i32_le(1);
    encoder.write_varint(1);
    encoder.write_hash_le(&NULL_HASH);
    encoder.write_u32_le(u32::MAX);
    encoder.write_var_bytes(&[0x03, height_tag, 0x00, 0x00]);
    encoder.write_u32_le(u32::MAX);
    encoder.write_varint(1);
    encoder.write_i64_le(50 * 100_000_000);
    encoder.write_var_bytes(&script);
    encoder.write_u32_le(0);
    let bytes = encoder.into_inner();
    (sha256d(&bytes), bytes)
}

fn setup(dir: &Path) -> ParserConfig {
    ParserConfig::new(dir.join("data"), dir.join("blocks"))
}

#[test]
fn rpc_ingest_synthesizes_genesis() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = setup(dir.path());

    let mut rpc = FakeRpc::default();
    let genesis_hash = rpc.push_block(header(NULL_HASH, 1), &[([0xee; 32], Vec::new())]);
    let (cb1_txid, cb1_bytes) = coinbase_paying(0x10, 1);
    rpc.push_block(header(genesis_hash, 2), &[(cb1_txid, cb1_bytes)]);

    let summary = Parser::new(config.clone()).ingest_rpc(&rpc).expect("ingest");
    assert_eq!(summary.blocks_added, 2);
    assert_eq!(summary.txs_added, 2);

    let access = ChainAccess::open(config.data_dir()).expect("access");
    assert_eq!(access.max_height(), 2);

    // The genesis coinbase is synthesized: 50 BTC to the well-known
    // P2PK output, hash 0x01 then zeros.
    let mut genesis_txid = NULL_HASH;
    genesis_txid[0] = 0x01;
    assert_eq!(access.tx_hash(0).expect("hash"), genesis_txid);
    let genesis_tx = access.tx(0).expect("tx");
    assert!(genesis_tx.is_coinbase());
    assert_eq!(genesis_tx.header.output_count, 1);
    let payout = genesis_tx.output(0).expect("output");
    assert_eq!(payout.inout.value, 50 * 100_000_000);
    assert_eq!(payout.inout.address_type, AddressType::Pubkey);

    assert_eq!(access.tx_hash(1).expect("hash"), cb1_txid);

    let addresses = AddressState::open(&config.address_checkpoint_path()).expect("addresses");
    assert_eq!(addresses.max_address_num(AddressType::Pubkey), 1);
    assert_eq!(addresses.max_address_num(AddressType::PubkeyHash), 1);

    let utxo = UtxoState::open(&config.utxo_checkpoint_path()).expect("utxo");
    assert_eq!(utxo.len(), 2);
}

#[test]
fn rpc_resume_ingests_only_new_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = setup(dir.path());

    let mut rpc = FakeRpc::default();
    let genesis_hash = rpc.push_block(header(NULL_HASH, 1), &[([0xee; 32], Vec::new())]);
    let (cb1_txid, cb1_bytes) = coinbase_paying(0x10, 1);
    let first_tip = rpc.push_block(header(genesis_hash, 2), &[(cb1_txid, cb1_bytes)]);

    Parser::new(config.clone()).ingest_rpc(&rpc).expect("ingest");

    // Upstream grows by one block; re-running picks up exactly that.
    let (cb2_txid, cb2_bytes) = coinbase_paying(0x20, 2);
    rpc.push_block(header(first_tip, 3), &[(cb2_txid, cb2_bytes)]);

    let summary = Parser::new(config.clone()).ingest_rpc(&rpc).expect("ingest");
    assert_eq!(summary.blocks_added, 1);
    assert_eq!(summary.txs_added, 1);

    let access = ChainAccess::open(config.data_dir()).expect("access");
    assert_eq!(access.max_height(), 3);
    assert_eq!(access.tx_hash(2).expect("hash"), cb2_txid);

    // And a third run with nothing new is a no-op.
    let summary = Parser::new(config.clone()).ingest_rpc(&rpc).expect("ingest");
    assert_eq!(summary.blocks_added, 0);
}
