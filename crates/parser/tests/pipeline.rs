use std::collections::HashSet;
use std::path::Path;

use chainscan_parser::address::AddressState;
use chainscan_parser::utxo::UtxoState;
use chainscan_parser::{Error, Parser, ParserConfig};
use chainscan_primitives::block::BlockHeader;
use chainscan_primitives::encoding::{encode, Encoder};
use chainscan_primitives::hash::sha256d;
use chainscan_primitives::outpoint::OutPoint;
use chainscan_primitives::script::AddressType;
use chainscan_primitives::{Hash256, NULL_HASH};
use chainscan_store::ChainAccess;

fn p2pk_script(tag: u8) -> Vec<u8> {
    let mut script = vec![33];
    script.extend_from_slice(&[tag; 33]);
    script.push(0xac);
    script
}

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn p2sh_script(hash: [u8; 20]) -> Vec<u8> {
    let mut script = vec![0xa9, 0x14];
    script.extend_from_slice(&hash);
    script.push(0x87);
    script
}

fn hash160(data: &[u8]) -> [u8; 20] {
    chainscan_primitives::hash::hash160(data)
}

struct TxBuild {
    bytes: Vec<u8>,
    txid: Hash256,
}

struct TxIn {
    prev_hash: Hash256,
    prev_index: u32,
    script_sig: Vec<u8>,
}

fn build_tx(inputs: &[TxIn], outputs: &[(u64, Vec<u8>)], locktime: u32) -> TxBuild {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(1);
    encoder.write_varint(inputs.len() as u64);
    for input in inputs {
        encoder.write_hash_le(&input.prev_hash);
        encoder.write_u32_le(input.prev_index);
        encoder.write_var_bytes(&input.script_sig);
        encoder.write_u32_le(u32::MAX);
    }
    encoder.write_varint(outputs.len() as u64);
    for (value, script) in outputs {
        encoder.write_i64_le(*value as i64);
        encoder.write_var_bytes(script);
    }
    encoder.write_u32_le(locktime);
    let bytes = encoder.into_inner();
    let txid = sha256d(&bytes);
    TxBuild { bytes, txid }
}

fn coinbase_tx(height_tag: u8, outputs: &[(u64, Vec<u8>)]) -> TxBuild {
    build_tx(
        &[TxIn {
            prev_hash: NULL_HASH,
            prev_index: u32::MAX,
            script_sig: vec![0x03, height_tag, 0x00, 0x00],
        }],
        outputs,
        0,
    )
}

/// A witness-serialized coinbase, the shape segwit blocks carry. The
/// txid still covers only the non-witness form.
fn witness_coinbase_tx(height_tag: u8, outputs: &[(u64, Vec<u8>)]) -> TxBuild {
    let script_sig = vec![0x03, height_tag, 0x00, 0x00];

    let mut wire = Encoder::new();
    wire.write_i32_le(1);
    wire.write_u8(0x00);
    wire.write_u8(0x01);
    wire.write_varint(1);
    wire.write_hash_le(&NULL_HASH);
    wire.write_u32_le(u32::MAX);
    wire.write_var_bytes(&script_sig);
    wire.write_u32_le(u32::MAX);
    wire.write_varint(outputs.len() as u64);
    for (value, script) in outputs {
        wire.write_i64_le(*value as i64);
        wire.write_var_bytes(script);
    }
    wire.write_varint(1);
    wire.write_var_bytes(&[0u8; 32]);
    wire.write_u32_le(0);

    let legacy = build_tx(
        &[TxIn {
            prev_hash: NULL_HASH,
            prev_index: u32::MAX,
            script_sig,
        }],
        outputs,
        0,
    );
    TxBuild {
        bytes: wire.into_inner(),
        txid: legacy.txid,
    }
}

fn segwit_commitment_script() -> Vec<u8> {
    let mut script = vec![0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
    script.extend_from_slice(&[0u8; 32]);
    script
}

struct BlockBuild {
    hash: Hash256,
    bytes: Vec<u8>,
}

fn build_block(prev: Hash256, nonce: u32, txs: &[&TxBuild]) -> BlockBuild {
    let header = BlockHeader {
        version: 1,
        prev_block: prev,
        merkle_root: [0u8; 32],
        time: 1_300_000_000 + nonce,
        bits: 0x1d00ffff,
        nonce,
    };
    let mut encoder = Encoder::new();
    encoder.write_bytes(&encode(&header));
    encoder.write_varint(txs.len() as u64);
    for tx in txs {
        encoder.write_bytes(&tx.bytes);
    }
    BlockBuild {
        hash: header.hash(),
        bytes: encoder.into_inner(),
    }
}

fn frame_blocks(magic: u32, blocks: &[&BlockBuild]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        out.extend_from_slice(&magic.to_le_bytes());
        out.extend_from_slice(&(block.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&block.bytes);
    }
    out
}

fn setup(dir: &Path) -> ParserConfig {
    let blocks_dir = dir.join("blocks");
    let data_dir = dir.join("data");
    std::fs::create_dir_all(&blocks_dir).expect("blocks dir");
    ParserConfig::new(data_dir, blocks_dir)
}

fn write_blk_file(config: &ParserConfig, file_num: u32, bytes: &[u8]) {
    std::fs::write(config.path_for_block_file(file_num), bytes).expect("write blk file");
}

/// Height monotonicity and hash uniqueness over the persisted store.
fn check_store_invariants(config: &ParserConfig) {
    let access = ChainAccess::open(config.data_dir()).expect("access");
    let heights = access.max_height();
    let mut expected_first = 0u32;
    for height in 0..heights {
        let block = access.block(height).expect("block");
        assert_eq!(block.height, height as u32);
        assert_eq!(block.first_tx_index, expected_first);
        expected_first += block.tx_count;
    }

    let tx_count = access.max_loaded_tx().expect("tx count");
    let mut seen = HashSet::new();
    for tx_num in 0..tx_count {
        assert!(seen.insert(access.tx_hash(tx_num).expect("hash")));
    }
}

#[test]
fn single_coinbase_block() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = setup(dir.path());

    let reward = 50 * 100_000_000u64;
    let coinbase = coinbase_tx(0, &[(reward, p2pk_script(0xa1))]);
    let genesis = build_block(NULL_HASH, 1, &[&coinbase]);
    write_blk_file(&config, 0, &frame_blocks(config.block_magic, &[&genesis]));

    let summary = Parser::new(config.clone()).ingest_files().expect("ingest");
    assert_eq!(summary.blocks_added, 1);
    assert_eq!(summary.txs_added, 1);
    assert!(summary.revealed.is_empty());

    let access = ChainAccess::open(config.data_dir()).expect("access");
    assert_eq!(access.max_height(), 1);
    let block = access.block(0).expect("block");
    assert_eq!(block.first_tx_index, 0);
    assert_eq!(block.tx_count, 1);
    assert_eq!(block.hash, genesis.hash);

    // One record, zero inputs, one output; the coinbase bytes are
    // retrievable through the block's offset.
    let tx = access.tx(0).expect("tx");
    assert!(tx.is_coinbase());
    assert_eq!(tx.header.input_count, 0);
    assert_eq!(tx.header.output_count, 1);
    let output = tx.output(0).expect("output");
    assert_eq!(output.inout.value, reward);
    assert_eq!(output.inout.to_address_num, 1);
    assert_eq!(output.inout.address_type, AddressType::Pubkey);
    assert_eq!(
        access.coinbase(block.coinbase_offset).expect("coinbase"),
        vec![0x03, 0x00, 0x00, 0x00]
    );
    assert_eq!(access.tx_hash(0).expect("hash"), coinbase.txid);

    let utxo = UtxoState::open(&config.utxo_checkpoint_path()).expect("utxo");
    assert_eq!(utxo.len(), 1);
    assert!(utxo.contains(&OutPoint::new(coinbase.txid, 0)));

    let addresses = AddressState::open(&config.address_checkpoint_path()).expect("addresses");
    assert_eq!(addresses.max_address_num(AddressType::Pubkey), 1);
    assert_eq!(addresses.max_address_num(AddressType::PubkeyHash), 0);

    check_store_invariants(&config);
}

#[test]
fn simple_spend_links_both_directions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = setup(dir.path());

    let reward = 50 * 100_000_000u64;
    let fee = 10_000u64;

    let coinbase_a = coinbase_tx(0, &[(reward, p2pk_script(0xaa))]);
    let block0 = build_block(NULL_HASH, 1, &[&coinbase_a]);

    let coinbase_c = coinbase_tx(1, &[(reward, p2pk_script(0xcc))]);
    let spend = build_tx(
        &[TxIn {
            prev_hash: coinbase_a.txid,
            prev_index: 0,
            script_sig: vec![0x02, 0x01, 0x02],
        }],
        &[(reward - fee, p2pkh_script(0xbb))],
        0,
    );
    let block1 = build_block(block0.hash, 2, &[&coinbase_c, &spend]);

    write_blk_file(
        &config,
        0,
        &frame_blocks(config.block_magic, &[&block0, &block1]),
    );

    Parser::new(config.clone()).ingest_files().expect("ingest");

    // UTXO set: only the height-1 coinbase and B's output remain.
    let utxo = UtxoState::open(&config.utxo_checkpoint_path()).expect("utxo");
    assert_eq!(utxo.len(), 2);
    assert!(!utxo.contains(&OutPoint::new(coinbase_a.txid, 0)));
    assert!(utxo.contains(&OutPoint::new(coinbase_c.txid, 0)));
    let b_entry = utxo.get(&OutPoint::new(spend.txid, 0)).expect("B's output");
    assert_eq!(b_entry.value, reward - fee);
    assert_eq!(b_entry.producing_tx_num, 2);

    let access = ChainAccess::open(config.data_dir()).expect("access");
    assert_eq!(access.max_loaded_tx().expect("count"), 3);

    // The spend points back at its producing transaction, and the
    // spent output points forward at the spender.
    let spend_view = access.tx(2).expect("tx");
    let spend_input = spend_view.input(0).expect("input");
    assert_eq!(spend_input.inout.linked_tx_num, 0);
    assert_eq!(spend_input.inout.address_type, AddressType::Pubkey);
    assert_eq!(spend_input.inout.to_address_num, 1);
    assert_eq!(spend_input.inout.value, reward);

    let produced = access.tx(0).expect("tx").output(0).expect("output");
    assert_eq!(produced.inout.linked_tx_num, 2);

    // Address density: every assigned ID is referenced, no gaps.
    let addresses = AddressState::open(&config.address_checkpoint_path()).expect("addresses");
    assert_eq!(addresses.max_address_num(AddressType::Pubkey), 2);
    assert_eq!(addresses.max_address_num(AddressType::PubkeyHash), 1);
    let mut referenced = HashSet::new();
    for tx_num in 0..3 {
        let view = access.tx(tx_num).expect("tx");
        for slot in view.inputs() {
            if slot.inout.address_type == AddressType::Pubkey {
                referenced.insert(slot.inout.to_address_num);
            }
        }
        for slot in view.outputs() {
            if slot.inout.address_type == AddressType::Pubkey {
                referenced.insert(slot.inout.to_address_num);
            }
        }
    }
    assert_eq!(referenced, HashSet::from([1, 2]));

    check_store_invariants(&config);
}

#[test]
fn segwit_activation_flags_every_tx_in_block() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = setup(dir.path());

    let reward = 50 * 100_000_000u64;
    let plain_coinbase = coinbase_tx(0, &[(reward, p2pk_script(0x0a))]);
    let block0 = build_block(NULL_HASH, 1, &[&plain_coinbase]);

    let segwit_coinbase = witness_coinbase_tx(
        1,
        &[
            (reward, p2pk_script(0x0b)),
            (0, segwit_commitment_script()),
        ],
    );
    let payment = build_tx(
        &[TxIn {
            prev_hash: plain_coinbase.txid,
            prev_index: 0,
            script_sig: vec![0x01, 0x55],
        }],
        &[(reward - 5_000, p2pkh_script(0x0c))],
        0,
    );
    let block1 = build_block(block0.hash, 2, &[&segwit_coinbase, &payment]);

    write_blk_file(
        &config,
        0,
        &frame_blocks(config.block_magic, &[&block0, &block1]),
    );
    Parser::new(config.clone()).ingest_files().expect("ingest");

    let access = ChainAccess::open(config.data_dir()).expect("access");
    assert!(!access.tx(0).expect("tx").header.is_segwit);
    assert!(access.tx(1).expect("tx").header.is_segwit);
    assert!(access.tx(2).expect("tx").header.is_segwit);

    // The OP_RETURN commitment output never enters the UTXO set.
    let utxo = UtxoState::open(&config.utxo_checkpoint_path()).expect("utxo");
    assert_eq!(utxo.len(), 2);
    assert!(!utxo.contains(&OutPoint::new(segwit_coinbase.txid, 1)));

    check_store_invariants(&config);
}

#[test]
fn p2sh_spend_reveals_wrapped_script() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = setup(dir.path());

    let reward = 50 * 100_000_000u64;
    let redeem = p2pkh_script(0x33);
    let wrapped_hash = hash160(&redeem);

    let coinbase_a = coinbase_tx(0, &[(reward, p2sh_script(wrapped_hash))]);
    let block0 = build_block(NULL_HASH, 1, &[&coinbase_a]);

    let mut script_sig = vec![0x02, 0xde, 0xad];
    script_sig.push(redeem.len() as u8);
    script_sig.extend_from_slice(&redeem);
    let coinbase_c = coinbase_tx(1, &[(reward, p2pk_script(0x44))]);
    let spend = build_tx(
        &[TxIn {
            prev_hash: coinbase_a.txid,
            prev_index: 0,
            script_sig,
        }],
        &[(reward - 1_000, p2pkh_script(0x55))],
        0,
    );
    let block1 = build_block(block0.hash, 2, &[&coinbase_c, &spend]);

    write_blk_file(
        &config,
        0,
        &frame_blocks(config.block_magic, &[&block0, &block1]),
    );
    let summary = Parser::new(config.clone()).ingest_files().expect("ingest");

    // The spent P2SH address is reported revealed, and the redeem
    // script now lives in its own partition.
    assert_eq!(summary.revealed, vec![1]);
    let addresses = AddressState::open(&config.address_checkpoint_path()).expect("addresses");
    assert_eq!(addresses.max_address_num(AddressType::ScriptHash), 1);
    assert_eq!(
        addresses.lookup(AddressType::PubkeyHash, &[0x33; 20]),
        Some(1)
    );

    check_store_invariants(&config);
}

#[test]
fn resume_equals_single_shot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let resumed = setup(&dir.path().join("resumed"));
    let single = setup(&dir.path().join("single"));

    let reward = 50 * 100_000_000u64;
    let cb0 = coinbase_tx(0, &[(reward, p2pk_script(0x01))]);
    let block0 = build_block(NULL_HASH, 1, &[&cb0]);
    let cb1 = coinbase_tx(1, &[(reward, p2pk_script(0x02))]);
    let block1 = build_block(block0.hash, 2, &[&cb1]);
    let cb2 = coinbase_tx(2, &[(reward, p2pk_script(0x03))]);
    let spend = build_tx(
        &[TxIn {
            prev_hash: cb0.txid,
            prev_index: 0,
            script_sig: vec![0x01, 0x99],
        }],
        &[(reward - 2_000, p2pkh_script(0x04))],
        0,
    );
    let block2 = build_block(block1.hash, 3, &[&cb2, &spend]);
    let cb3 = coinbase_tx(3, &[(reward, p2pk_script(0x05))]);
    let block3 = build_block(block2.hash, 4, &[&cb3]);

    let framed = frame_blocks(
        resumed.block_magic,
        &[&block0, &block1, &block2, &block3],
    );
    write_blk_file(&resumed, 0, &framed);
    write_blk_file(&single, 0, &framed);

    // Two-step ingest: heights [0, 2), then the rest.
    let mut capped = resumed.clone();
    capped.max_block_height = Some(2);
    let first = Parser::new(capped).ingest_files().expect("ingest");
    assert_eq!(first.blocks_added, 2);
    let second = Parser::new(resumed.clone()).ingest_files().expect("ingest");
    assert_eq!(second.blocks_added, 2);
    assert_eq!(second.txs_added, 3);

    Parser::new(single.clone()).ingest_files().expect("ingest");

    // The resumed store is byte-identical to the single-shot store.
    for file in [
        chainscan_store::access::files::BLOCKS,
        chainscan_store::access::files::COINBASE,
        chainscan_store::access::files::TX_DATA,
        chainscan_store::access::files::TX_INDEX,
        chainscan_store::access::files::TX_HASHES,
        chainscan_store::access::files::SEQUENCE_DATA,
        chainscan_store::access::files::SEQUENCE_INDEX,
    ] {
        let resumed_bytes = std::fs::read(resumed.data_dir().join(file)).expect("read");
        let single_bytes = std::fs::read(single.data_dir().join(file)).expect("read");
        assert_eq!(resumed_bytes, single_bytes, "file {file} diverged");
    }

    let resumed_utxo = UtxoState::open(&resumed.utxo_checkpoint_path()).expect("utxo");
    let single_utxo = UtxoState::open(&single.utxo_checkpoint_path()).expect("utxo");
    assert_eq!(resumed_utxo.len(), single_utxo.len());
    assert_eq!(
        resumed_utxo.get(&OutPoint::new(spend.txid, 0)),
        single_utxo.get(&OutPoint::new(spend.txid, 0))
    );

    check_store_invariants(&resumed);
    check_store_invariants(&single);
}

#[test]
fn zero_new_blocks_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = setup(dir.path());

    let coinbase = coinbase_tx(0, &[(50_0000_0000, p2pk_script(0x07))]);
    let genesis = build_block(NULL_HASH, 1, &[&coinbase]);
    write_blk_file(&config, 0, &frame_blocks(config.block_magic, &[&genesis]));

    Parser::new(config.clone()).ingest_files().expect("ingest");
    let before = std::fs::read(config.data_dir().join(chainscan_store::access::files::TX_DATA))
        .expect("read");

    let summary = Parser::new(config.clone()).ingest_files().expect("ingest");
    assert_eq!(summary.blocks_added, 0);
    assert_eq!(summary.txs_added, 0);

    let after = std::fs::read(config.data_dir().join(chainscan_store::access::files::TX_DATA))
        .expect("read");
    assert_eq!(before, after);
}

#[test]
fn reorg_surfaces_before_any_write() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = setup(dir.path());

    let reward = 50 * 100_000_000u64;
    let cb0 = coinbase_tx(0, &[(reward, p2pk_script(0x01))]);
    let block0 = build_block(NULL_HASH, 1, &[&cb0]);
    let cb1 = coinbase_tx(1, &[(reward, p2pk_script(0x02))]);
    let block1 = build_block(block0.hash, 2, &[&cb1]);
    let cb2 = coinbase_tx(2, &[(reward, p2pk_script(0x03))]);
    let block2 = build_block(block1.hash, 3, &[&cb2]);

    write_blk_file(
        &config,
        0,
        &frame_blocks(config.block_magic, &[&block0, &block1, &block2]),
    );
    Parser::new(config.clone()).ingest_files().expect("ingest");

    // Upstream replaces block 2 with a longer branch, appended to the
    // container file the way a node would.
    let cb2_fork = coinbase_tx(2, &[(reward, p2pk_script(0x63))]);
    let block2_fork = build_block(block1.hash, 99, &[&cb2_fork]);
    let cb3_fork = coinbase_tx(3, &[(reward, p2pk_script(0x64))]);
    let block3_fork = build_block(block2_fork.hash, 100, &[&cb3_fork]);

    let mut file_bytes =
        std::fs::read(config.path_for_block_file(0)).expect("read blk file");
    file_bytes.extend_from_slice(&frame_blocks(
        config.block_magic,
        &[&block2_fork, &block3_fork],
    ));
    std::fs::write(config.path_for_block_file(0), file_bytes).expect("write blk file");

    let err = Parser::new(config.clone())
        .ingest_files()
        .expect_err("reorg must surface");
    assert!(matches!(err, Error::Reorg { height: 2 }));

    // Nothing was written: the store still ends at the old tip.
    let access = ChainAccess::open(config.data_dir()).expect("access");
    assert_eq!(access.max_height(), 3);
    assert_eq!(access.block(2).expect("block").hash, block2.hash);
    drop(access);

    // Opting out of the hard error re-ingests the divergent suffix.
    let mut tolerant = config.clone();
    tolerant.error_on_reorg = false;
    Parser::new(tolerant).ingest_files().expect("ingest");

    let access = ChainAccess::open(config.data_dir()).expect("access");
    assert_eq!(access.max_height(), 4);
    assert_eq!(access.block(2).expect("block").hash, block2_fork.hash);
    assert_eq!(access.block(3).expect("block").hash, block3_fork.hash);

    check_store_invariants(&config);
}
