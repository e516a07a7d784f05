//! The four-stage ingestion pipeline.
//!
//! Reader -> hasher -> UTXO resolver -> address resolver, linked by
//! bounded channels that carry owned `RawTransaction` buffers, plus a
//! free-list channel returning retired buffers to the reader. A full
//! queue blocks the producer; a dropped sender tells the consumer that
//! upstream finished and the queue is drained.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use chainscan_log::{log_debug, log_info};
use chainscan_primitives::encoding::{DecodeError, Decoder};
use chainscan_primitives::outpoint::OutPoint;
use chainscan_primitives::script::ScriptOutput;
use chainscan_primitives::{Hash256, NULL_HASH};
use chainscan_store::{
    BlobFile, BlockRecord, FixedRecordFile, IndexedFile, Inout, TxFile, TxRecordHeader,
};

use crate::address::{process_input, process_output, AddressState, AddressWriter};
use crate::chain_index::{BlockInfo, BlockLocation};
use crate::config::ParserConfig;
use crate::error::Error;
use crate::raw_tx::RawTransaction;
use crate::rpc::RpcSource;
use crate::utxo::{UtxoEntry, UtxoState};

/// Capacity of each inter-stage queue.
const QUEUE_CAPACITY: usize = 10_000;

/// Records larger than this retire instead of returning to the free
/// list; a footprint knob, not semantics.
const RECYCLE_MAX_SIZE: u32 = 800;

/// The 65-byte pubkey paid by the genesis coinbase.
const GENESIS_PUBKEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71, 0x30,
    0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f,
    0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5,
    0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

const GENESIS_REWARD: u64 = 50 * 100_000_000;
const GENESIS_TX_SIZE: u32 = 204;

pub enum BlockSource<'a> {
    /// Seek into `blkNNNNN.dat` container files.
    Files,
    Rpc(&'a dyn RpcSource),
}

pub struct BlockProcessor {
    starting_tx_count: u32,
    total_tx_count: u32,
    max_block_height: u32,
}

impl BlockProcessor {
    pub fn new(starting_tx_count: u32, total_tx_count: u32, max_block_height: u32) -> Self {
        Self {
            starting_tx_count,
            total_tx_count,
            max_block_height,
        }
    }

    /// Runs the four stages over `blocks` and returns the addresses
    /// revealed by spends (e.g. P2SH preimages seen for the first
    /// time).
    pub fn add_new_blocks(
        &self,
        config: &ParserConfig,
        source: BlockSource<'_>,
        blocks: Vec<BlockInfo>,
        utxo: &mut UtxoState,
        addresses: &mut AddressState,
        address_writer: AddressWriter,
    ) -> Result<Vec<u32>, Error> {
        let mut block_file: FixedRecordFile<BlockRecord> =
            FixedRecordFile::open(&config.block_file_path())?;
        let mut coinbase_file = BlobFile::open(&config.coinbase_file_path())?;
        let mut sequence_file =
            IndexedFile::open(&config.sequence_file_path(), &config.sequence_index_path())?;
        let mut hash_file: FixedRecordFile<Hash256> =
            FixedRecordFile::open(&config.tx_hashes_path())?;
        let tx_file = TxFile::open(&config.tx_file_path(), &config.tx_index_path())?;

        let (hash_tx, hash_rx) = bounded::<Box<RawTransaction>>(QUEUE_CAPACITY);
        let (utxo_tx, utxo_rx) = bounded::<Box<RawTransaction>>(QUEUE_CAPACITY);
        let (addr_tx, addr_rx) = bounded::<Box<RawTransaction>>(QUEUE_CAPACITY);
        let (free_tx, free_rx) = bounded::<Box<RawTransaction>>(QUEUE_CAPACITY);

        let reader = ReaderStage {
            config,
            source: &source,
            blocks: &blocks,
            starting_tx_count: self.starting_tx_count,
            block_file: &mut block_file,
            coinbase_file: &mut coinbase_file,
            sequence_file: &mut sequence_file,
        };
        let tx_file_ref = &tx_file;
        let hash_file_ref = &mut hash_file;
        let progress = Progress {
            starting_tx_count: self.starting_tx_count,
            total_tx_count: self.total_tx_count,
            max_block_height: self.max_block_height,
        };

        let (read_result, hash_result, utxo_result, addr_result) = std::thread::scope(|scope| {
            let read_handle = scope.spawn(move || reader.run(free_rx, hash_tx));
            let hash_handle = scope.spawn(move || run_hasher(hash_rx, utxo_tx, hash_file_ref));
            let utxo_handle =
                scope.spawn(move || run_utxo_resolver(utxo_rx, addr_tx, tx_file_ref, utxo));
            let addr_handle = scope.spawn(move || {
                run_address_resolver(
                    addr_rx,
                    free_tx,
                    tx_file_ref,
                    addresses,
                    address_writer,
                    progress,
                )
            });

            // Join in pipeline order.
            (
                read_handle.join().expect("reader stage panicked"),
                hash_handle.join().expect("hash stage panicked"),
                utxo_handle.join().expect("utxo stage panicked"),
                addr_handle.join().expect("address stage panicked"),
            )
        });

        tx_file.flush()?;

        read_result?;
        hash_result?;
        utxo_result?;
        addr_result
    }
}

struct Progress {
    starting_tx_count: u32,
    total_tx_count: u32,
    max_block_height: u32,
}

// ---------------------------------------------------------------------------
// Stage 1: reader

/// Open container files, each kept until every transaction it
/// contributes has cleared the pipeline.
struct FileCache {
    files: HashMap<u32, File>,
    last_tx_required: HashMap<u32, u32>,
}

impl FileCache {
    fn new(blocks: &[BlockInfo], starting_tx_count: u32) -> Self {
        let mut last_tx_required = HashMap::new();
        let mut first_tx_num = starting_tx_count;
        for block in blocks {
            first_tx_num += block.tx_count;
            if let BlockLocation::File { file_num, .. } = block.location {
                last_tx_required.insert(file_num, first_tx_num);
            }
        }
        Self {
            files: HashMap::new(),
            last_tx_required,
        }
    }

    fn open(&mut self, config: &ParserConfig, file_num: u32) -> Result<&File, Error> {
        if !self.files.contains_key(&file_num) {
            let path = config.path_for_block_file(file_num);
            self.files.insert(file_num, File::open(path)?);
        }
        Ok(self.files.get(&file_num).expect("file just inserted"))
    }

    /// Closes files whose last contributed transaction is behind the
    /// downstream watermark.
    fn close_finished(&mut self, watermark_tx_num: u32) {
        let last_tx_required = &self.last_tx_required;
        self.files.retain(|file_num, _| {
            last_tx_required
                .get(file_num)
                .map_or(false, |&last| last >= watermark_tx_num)
        });
    }
}

struct ReaderStage<'a> {
    config: &'a ParserConfig,
    source: &'a BlockSource<'a>,
    blocks: &'a [BlockInfo],
    starting_tx_count: u32,
    block_file: &'a mut FixedRecordFile<BlockRecord>,
    coinbase_file: &'a mut BlobFile,
    sequence_file: &'a mut IndexedFile,
}

impl ReaderStage<'_> {
    fn run(
        mut self,
        free_rx: Receiver<Box<RawTransaction>>,
        hash_tx: Sender<Box<RawTransaction>>,
    ) -> Result<(), Error> {
        let mut cache = FileCache::new(self.blocks, self.starting_tx_count);
        let mut current_tx_num = self.starting_tx_count;
        let mut block_buf: Vec<u8> = Vec::new();
        let mut scratch = RawTransaction::new();

        for block in self.blocks {
            let height = block.height as u32;
            let first_tx_index = current_tx_num;
            let mut coinbase: Vec<u8> = Vec::new();

            match &block.location {
                BlockLocation::File { file_num, data_pos } => {
                    let file = cache.open(self.config, *file_num)?;
                    block_buf.resize(block.size as usize, 0);
                    file.read_exact_at(&mut block_buf, *data_pos)?;

                    let block_path = self.config.path_for_block_file(*file_num);
                    let base_offset = *data_pos;
                    let corrupt = move |reason: DecodeError, offset: u64| Error::CorruptBlockFile {
                        path: block_path.clone(),
                        offset: base_offset + offset,
                        reason,
                    };

                    let mut decoder = Decoder::new(&block_buf);
                    decoder
                        .skip(80)
                        .map_err(|reason| corrupt(reason, 0))?;
                    let tx_count = decoder
                        .read_varint()
                        .map_err(|reason| corrupt(reason, 80))?;

                    // Segwit detection pass: find the coinbase and look
                    // for the witness commitment in its outputs.
                    let first_tx_offset = decoder.position();
                    let mut segwit = false;
                    for _ in 0..tx_count {
                        scratch
                            .load(&mut decoder, 0, 0, false)
                            .map_err(|reason| corrupt(reason, first_tx_offset as u64))?;
                        if scratch.has_coinbase_input() {
                            segwit = check_segwit(&scratch);
                            break;
                        }
                    }
                    decoder
                        .seek(first_tx_offset)
                        .map_err(|reason| corrupt(reason, 0))?;

                    for _ in 0..tx_count {
                        let mut tx = obtain_buffer(&free_rx, &mut cache);
                        let offset = decoder.position() as u64;
                        tx.load(&mut decoder, current_tx_num, height, segwit)
                            .map_err(|reason| corrupt(reason, offset))?;

                        self.write_sequences(&tx)?;
                        if tx.has_coinbase_input() {
                            coinbase = tx.strip_coinbase_input();
                        }

                        if hash_tx.send(tx).is_err() {
                            return Ok(());
                        }
                        current_tx_num += 1;
                    }
                }
                BlockLocation::Rpc { tx_ids } => {
                    let BlockSource::Rpc(rpc) = self.source else {
                        return Err(Error::Rpc(
                            "block indexed via RPC but no RPC source given".to_string(),
                        ));
                    };

                    // Witness activation from the coinbase, same check
                    // as file mode.
                    load_rpc_tx(&mut scratch, *rpc, block, tx_ids, 0, 0, 0, false)?;
                    let segwit = check_segwit(&scratch);

                    for (offset, _) in tx_ids.iter().enumerate() {
                        let mut tx = obtain_buffer(&free_rx, &mut cache);
                        load_rpc_tx(
                            &mut tx,
                            *rpc,
                            block,
                            tx_ids,
                            offset,
                            current_tx_num,
                            height,
                            segwit,
                        )?;

                        self.write_sequences(&tx)?;
                        if tx.has_coinbase_input() {
                            coinbase = tx.strip_coinbase_input();
                        }

                        if hash_tx.send(tx).is_err() {
                            return Ok(());
                        }
                        current_tx_num += 1;
                    }
                }
            }

            let coinbase_offset = self.coinbase_file.append(&coinbase)?;
            self.block_file.append(&BlockRecord {
                first_tx_index,
                tx_count: block.tx_count,
                height,
                hash: block.hash,
                version: block.header.version,
                time: block.header.time,
                bits: block.header.bits,
                nonce: block.header.nonce,
                coinbase_offset,
            })?;
        }
        Ok(())
    }

    fn write_sequences(&mut self, tx: &RawTransaction) -> Result<(), Error> {
        self.sequence_file.begin_group()?;
        for input in &tx.inputs {
            self.sequence_file.write(&input.sequence.to_le_bytes())?;
        }
        Ok(())
    }
}

fn obtain_buffer(
    free_rx: &Receiver<Box<RawTransaction>>,
    cache: &mut FileCache,
) -> Box<RawTransaction> {
    match free_rx.try_recv() {
        Ok(tx) => {
            cache.close_finished(tx.tx_num);
            tx
        }
        Err(_) => Box::new(RawTransaction::new()),
    }
}

/// Inspects a coinbase's outputs, newest first, for the witness
/// commitment.
fn check_segwit(coinbase: &RawTransaction) -> bool {
    coinbase
        .outputs
        .iter()
        .rev()
        .any(|output| output.script_output.is_segwit_commitment())
}

#[allow(clippy::too_many_arguments)]
fn load_rpc_tx(
    tx: &mut RawTransaction,
    rpc: &dyn RpcSource,
    block: &BlockInfo,
    tx_ids: &[Hash256],
    tx_offset: usize,
    tx_num: u32,
    height: u32,
    segwit: bool,
) -> Result<(), Error> {
    if block.height == 0 {
        load_genesis_coinbase(tx);
        return Ok(());
    }
    let tx_id = tx_ids
        .get(tx_offset)
        .ok_or(Error::Rpc("transaction offset out of range".to_string()))?;
    let bytes = rpc.raw_transaction(tx_id)?;
    let mut decoder = Decoder::new(&bytes);
    tx.load(&mut decoder, tx_num, height, segwit)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes.into());
    }
    Ok(())
}

/// The upstream node cannot serve the genesis coinbase, so it is
/// synthesized: the standard 50 BTC P2PK payout with hash `0x01`
/// followed by 31 zero bytes.
fn load_genesis_coinbase(tx: &mut RawTransaction) {
    let mut script = Vec::with_capacity(67);
    script.push(65);
    script.extend_from_slice(&GENESIS_PUBKEY);
    script.push(0xac);

    tx.tx_num = 0;
    tx.block_height = 0;
    tx.size_bytes = GENESIS_TX_SIZE;
    tx.locktime = 0;
    tx.version = 1;
    tx.is_segwit = false;
    tx.inputs.clear();
    tx.outputs.clear();
    tx.outputs.push(crate::raw_tx::RawOutput {
        value: GENESIS_REWARD,
        script_output: ScriptOutput::from_script(&script),
    });
    tx.is_coinbase = true;
    tx.coinbase_script.clear();
    tx.coinbase_sequence = 0;
    tx.hash = NULL_HASH;
    tx.hash[0] = 0x01;
}

// ---------------------------------------------------------------------------
// Stage 2: hasher

fn run_hasher(
    input: Receiver<Box<RawTransaction>>,
    output: Sender<Box<RawTransaction>>,
    hash_file: &mut FixedRecordFile<Hash256>,
) -> Result<(), Error> {
    for mut tx in input.iter() {
        // A synthesized transaction arrives with its hash pre-set.
        if tx.hash == NULL_HASH {
            tx.compute_hash();
        }
        hash_file.append(&tx.hash)?;
        if output.send(tx).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage 3: UTXO resolver

fn run_utxo_resolver(
    input: Receiver<Box<RawTransaction>>,
    output: Sender<Box<RawTransaction>>,
    tx_file: &TxFile,
    utxo: &mut UtxoState,
) -> Result<(), Error> {
    let mut inouts: Vec<Inout> = Vec::new();

    for mut tx in input.iter() {
        inouts.clear();

        for input in &mut tx.inputs {
            let entry = utxo.spend(&input.prev_outpoint)?;
            input.address_type = entry.address_type;
            input.linked_tx_num = entry.producing_tx_num;
            inouts.push(Inout {
                linked_tx_num: entry.producing_tx_num,
                to_address_num: 0,
                address_type: entry.address_type,
                value: entry.value,
            });
        }

        for (index, output_slot) in tx.outputs.iter().enumerate() {
            let address_type = output_slot.script_output.address_type();
            inouts.push(Inout {
                linked_tx_num: 0,
                to_address_num: 0,
                address_type,
                value: output_slot.value,
            });
            if address_type.is_spendable() {
                utxo.add(
                    OutPoint::new(tx.hash, index as u32),
                    UtxoEntry {
                        producing_tx_num: tx.tx_num,
                        value: output_slot.value,
                        address_type,
                        fingerprint: output_slot.script_output.fingerprint().to_vec(),
                    },
                )?;
            }
        }

        let header = TxRecordHeader {
            size_bytes: tx.size_bytes,
            locktime: tx.locktime,
            version: tx.version,
            input_count: tx.inputs.len() as u16,
            output_count: tx.outputs.len() as u16,
            is_segwit: tx.is_segwit,
        };
        let written = tx_file.append_tx(&header, &inouts)?;
        debug_assert_eq!(written, tx.tx_num as u64);

        // Flush before blocking on a full downstream queue so the
        // address stage sees every record it is about to patch.
        match output.try_send(tx) {
            Ok(()) => {}
            Err(TrySendError::Full(tx)) => {
                tx_file.flush()?;
                if output.send(tx).is_err() {
                    return Ok(());
                }
            }
            Err(TrySendError::Disconnected(_)) => return Ok(()),
        }

        utxo.optional_save()?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage 4: address resolver

fn run_address_resolver(
    input: Receiver<Box<RawTransaction>>,
    free_tx: Sender<Box<RawTransaction>>,
    tx_file: &TxFile,
    addresses: &mut AddressState,
    mut writer: AddressWriter,
    progress: Progress,
) -> Result<Vec<u32>, Error> {
    let marker = (progress.total_tx_count / 1000).max(1);
    let mut revealed = Vec::new();

    for tx in input.iter() {
        for (index, input_slot) in tx.inputs.iter().enumerate() {
            let spent = tx_file.read_output(
                input_slot.linked_tx_num as u64,
                input_slot.prev_outpoint.index as u16,
            )?;
            debug_assert!(spent.to_address_num > 0);

            tx_file.patch_input_to_address(tx.tx_num as u64, index as u16, spent.to_address_num)?;
            tx_file.patch_output_spent_by(
                input_slot.linked_tx_num as u64,
                input_slot.prev_outpoint.index as u16,
                tx.tx_num,
            )?;

            process_input(
                input_slot,
                spent.to_address_num,
                spent.address_type,
                tx.tx_num,
                addresses,
                &mut writer,
                &mut revealed,
            )?;
        }

        for (index, output_slot) in tx.outputs.iter().enumerate() {
            let address_num =
                process_output(&output_slot.script_output, tx.tx_num, addresses, &mut writer)?;
            tx_file.patch_output_to_address(tx.tx_num as u64, index as u16, address_num)?;
        }

        let done = tx.tx_num - progress.starting_tx_count;
        if done % marker == 0 && progress.total_tx_count > 0 {
            log_debug!(
                "{:.1}% done, block {}/{}",
                (done as f64 / progress.total_tx_count as f64) * 100.0,
                tx.block_height,
                progress.max_block_height
            );
        }

        if tx.size_bytes <= RECYCLE_MAX_SIZE {
            // Full free list: retire the buffer instead.
            let _ = free_tx.try_send(tx);
        }

        addresses.optional_save()?;
    }

    log_info!(
        "address stage finished; {} spend(s) revealed wrapped scripts",
        revealed.len()
    );
    Ok(revealed)
}
