//! Indexes raw block container files (or an RPC feed) into a linked
//! block map and emits the canonical longest chain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chainscan_log::{log_error, log_info};
use chainscan_primitives::block::BlockHeader;
use chainscan_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use chainscan_primitives::transaction::TransactionHeader;
use chainscan_primitives::{Hash256, NULL_HASH};

use crate::config::ParserConfig;
use crate::error::Error;
use crate::rpc::RpcSource;

/// Concurrent container-file scanner cap.
const MAX_SCAN_WORKERS: u32 = 20;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockLocation {
    File { file_num: u32, data_pos: u64 },
    Rpc { tx_ids: Vec<Hash256> },
}

#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub hash: Hash256,
    pub header: BlockHeader,
    /// Serialized block length in bytes.
    pub size: u32,
    pub tx_count: u32,
    /// Total inputs across the block, coinbase's null input excluded.
    pub input_count: u32,
    pub output_count: u32,
    /// -1 until heights are assigned.
    pub height: i32,
    pub location: BlockLocation,
}

#[derive(Default)]
pub struct ChainIndex {
    blocks: HashMap<Hash256, BlockInfo>,
    newest: Option<Hash256>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockInfo> {
        self.blocks.get(hash)
    }

    /// Scans container files for blocks newer than the previously
    /// indexed tip, then links heights from the null hash.
    pub fn update_from_files(&mut self, config: &ParserConfig) -> Result<(), Error> {
        let (first_file, first_pos) = match self.newest.as_ref().and_then(|h| self.blocks.get(h)) {
            Some(newest) => match newest.location {
                BlockLocation::File { file_num, data_pos } => {
                    (file_num, data_pos + newest.size as u64)
                }
                BlockLocation::Rpc { .. } => (0, 0),
            },
            None => (0, 0),
        };

        let mut max_file = first_file;
        while config.path_for_block_file(max_file + 1).exists() {
            max_file += 1;
        }
        if !config.path_for_block_file(first_file).exists() {
            return Ok(());
        }

        let file_count = max_file - first_file + 1;
        log_info!("indexing {file_count} block file(s) starting at blk{first_file:05}.dat");

        let next_file = AtomicU32::new(first_file);
        let merged: Mutex<Vec<(u32, Vec<BlockInfo>)>> = Mutex::new(Vec::new());
        let failure: Mutex<Option<Error>> = Mutex::new(None);

        let workers = MAX_SCAN_WORKERS.min(file_count);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let file_num = next_file.fetch_add(1, Ordering::Relaxed);
                    if file_num > max_file {
                        break;
                    }
                    if failure.lock().expect("scan failure lock").is_some() {
                        break;
                    }
                    let path = config.path_for_block_file(file_num);
                    let start = if file_num == first_file { first_pos } else { 0 };
                    match scan_block_file(&path, config.block_magic, start, file_num) {
                        Ok(blocks) => {
                            merged
                                .lock()
                                .expect("scan merge lock")
                                .push((file_num, blocks));
                        }
                        Err(err) => {
                            log_error!("failed to index block file {}: {err}", path.display());
                            let mut slot = failure.lock().expect("scan failure lock");
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                        }
                    }
                });
            }
        });

        if let Some(err) = failure.into_inner().expect("scan failure lock") {
            return Err(err);
        }

        let mut merged = merged.into_inner().expect("scan merge lock");
        merged.sort_by_key(|(file_num, _)| *file_num);
        for (file_num, blocks) in merged {
            if let Some(last) = blocks.last() {
                if file_num == max_file {
                    self.newest = Some(last.hash);
                }
            }
            for block in blocks {
                self.blocks.insert(block.hash, block);
            }
        }

        self.assign_heights();
        Ok(())
    }

    /// Queries the upstream chain, finds the highest height whose hash
    /// still matches locally (the split point), and indexes from there.
    pub fn update_from_rpc(&mut self, rpc: &dyn RpcSource) -> Result<(), Error> {
        let block_count = rpc.block_count()?;
        let local_chain = self.generate_chain(None);

        let split = find_split_point(block_count.min(local_chain.len() as u32), |height| {
            let upstream = rpc.block_hash(height)?;
            Ok(local_chain[height as usize].hash == upstream)
        })?;

        if split < local_chain.len() as u32 {
            log_info!(
                "upstream chain diverges from local index at height {split} (local tip {})",
                local_chain.len() - 1
            );
        }

        for height in split..block_count {
            let hash = rpc.block_hash(height)?;
            let block = rpc.block(&hash)?;
            let info = BlockInfo {
                hash,
                header: block.header,
                size: block.size,
                tx_count: block.tx_ids.len() as u32,
                input_count: 0,
                output_count: 0,
                height: height as i32,
                location: BlockLocation::Rpc {
                    tx_ids: block.tx_ids,
                },
            };
            if height == block_count - 1 {
                self.newest = Some(info.hash);
            }
            self.blocks.insert(info.hash, info);
        }
        Ok(())
    }

    /// Links blocks by `prev_block` and assigns heights breadth-first
    /// from the null hash; orphaned branches keep height -1.
    fn assign_heights(&mut self) {
        let mut children: HashMap<Hash256, Vec<Hash256>> = HashMap::new();
        for block in self.blocks.values() {
            children
                .entry(block.header.prev_block)
                .or_default()
                .push(block.hash);
        }

        let mut queue: Vec<(Hash256, i32)> = vec![(NULL_HASH, -1)];
        while let Some((hash, height)) = queue.pop() {
            let Some(descendants) = children.get(&hash) else {
                continue;
            };
            for child in descendants {
                let block = self.blocks.get_mut(child).expect("indexed child");
                block.height = height + 1;
                queue.push((block.hash, block.height));
            }
        }
    }

    /// Walks back from the highest block to the null hash and returns
    /// the chain oldest-first, truncated to `max_blocks` entries.
    pub fn generate_chain(&self, max_blocks: Option<u32>) -> Vec<BlockInfo> {
        let mut chain = Vec::new();
        let Some(best) = self
            .blocks
            .values()
            .filter(|block| block.height >= 0)
            .max_by_key(|block| block.height)
        else {
            return chain;
        };

        let mut hash = best.hash;
        while hash != NULL_HASH {
            let Some(block) = self.blocks.get(&hash) else {
                break;
            };
            chain.push(block.clone());
            hash = block.header.prev_block;
        }
        chain.reverse();

        if let Some(max) = max_blocks {
            chain.truncate(max as usize);
        }
        chain
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.blocks.len() as u64);
        for block in self.blocks.values() {
            encode_block_info(&mut encoder, block);
        }
        match &self.newest {
            Some(hash) => {
                encoder.write_u8(1);
                encoder.write_hash_le(hash);
            }
            None => encoder.write_u8(0),
        }
        std::fs::write(path, encoder.into_inner())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        let mut decoder = Decoder::new(&bytes);
        let count = decoder.read_u64_le()?;
        let mut blocks = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let block = decode_block_info(&mut decoder)?;
            blocks.insert(block.hash, block);
        }
        let newest = match decoder.read_u8()? {
            0 => None,
            _ => Some(decoder.read_hash_le()?),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes.into());
        }
        Ok(Self { blocks, newest })
    }
}

/// Binary search for the first height whose local hash no longer
/// matches the upstream.
fn find_split_point(
    upper: u32,
    matches: impl Fn(u32) -> Result<bool, Error>,
) -> Result<u32, Error> {
    let mut lo = 0u32;
    let mut hi = upper;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if matches(mid)? {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Walks one container file: `magic | length | header | varint txcount
/// | txs`, stopping at the first magic mismatch.
fn scan_block_file(
    path: &Path,
    magic: u32,
    start: u64,
    file_num: u32,
) -> Result<Vec<BlockInfo>, Error> {
    let bytes = std::fs::read(path)?;
    let mut decoder = Decoder::new(&bytes);
    let mut blocks = Vec::new();

    decoder
        .seek(start as usize)
        .map_err(|reason| Error::CorruptBlockFile {
            path: path.to_path_buf(),
            offset: start,
            reason,
        })?;

    loop {
        if decoder.remaining() < 4 {
            break;
        }
        let frame_magic = decoder.read_u32_le().expect("remaining checked");
        if frame_magic != magic {
            break;
        }

        let parsed = (|| -> Result<BlockInfo, DecodeError> {
            let length = decoder.read_u32_le()?;
            let data_pos = decoder.position() as u64;
            let header = BlockHeader::consensus_decode(&mut decoder)?;
            let tx_count = decoder.read_varint()?;
            let mut input_count: u32 = 0;
            let mut output_count: u32 = 0;
            for _ in 0..tx_count {
                let tx = TransactionHeader::scan(&mut decoder)?;
                input_count += tx.input_count;
                output_count += tx.output_count;
            }
            decoder.seek(data_pos as usize)?;
            decoder.skip(length as usize)?;
            // The coinbase's null input never reaches the store.
            input_count = input_count.saturating_sub(1);
            Ok(BlockInfo {
                hash: header.hash(),
                header,
                size: length,
                tx_count: tx_count as u32,
                input_count,
                output_count,
                height: -1,
                location: BlockLocation::File { file_num, data_pos },
            })
        })();

        match parsed {
            Ok(block) => blocks.push(block),
            Err(reason) => {
                return Err(Error::CorruptBlockFile {
                    path: path.to_path_buf(),
                    offset: decoder.position() as u64,
                    reason,
                })
            }
        }
    }
    Ok(blocks)
}

fn encode_block_info(encoder: &mut Encoder, block: &BlockInfo) {
    encoder.write_hash_le(&block.hash);
    block.header.consensus_encode(encoder);
    encoder.write_u32_le(block.size);
    encoder.write_u32_le(block.tx_count);
    encoder.write_u32_le(block.input_count);
    encoder.write_u32_le(block.output_count);
    encoder.write_i32_le(block.height);
    match &block.location {
        BlockLocation::File { file_num, data_pos } => {
            encoder.write_u8(0);
            encoder.write_u32_le(*file_num);
            encoder.write_u64_le(*data_pos);
        }
        BlockLocation::Rpc { tx_ids } => {
            encoder.write_u8(1);
            encoder.write_varint(tx_ids.len() as u64);
            for tx_id in tx_ids {
                encoder.write_hash_le(tx_id);
            }
        }
    }
}

fn decode_block_info(decoder: &mut Decoder) -> Result<BlockInfo, DecodeError> {
    let hash = decoder.read_hash_le()?;
    let header = BlockHeader::consensus_decode(decoder)?;
    let size = decoder.read_u32_le()?;
    let tx_count = decoder.read_u32_le()?;
    let input_count = decoder.read_u32_le()?;
    let output_count = decoder.read_u32_le()?;
    let height = decoder.read_i32_le()?;
    let location = match decoder.read_u8()? {
        0 => BlockLocation::File {
            file_num: decoder.read_u32_le()?,
            data_pos: decoder.read_u64_le()?,
        },
        1 => {
            let count = decoder.read_varint()?;
            let mut tx_ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                tx_ids.push(decoder.read_hash_le()?);
            }
            BlockLocation::Rpc { tx_ids }
        }
        _ => return Err(DecodeError::InvalidData("unknown block location tag")),
    };
    Ok(BlockInfo {
        hash,
        header,
        size,
        tx_count,
        input_count,
        output_count,
        height,
        location,
    })
}
