//! Read-side view over the persisted columnar files.

use std::path::Path;

use chainscan_primitives::Hash256;

use crate::blob::BlobFile;
use crate::fixed::FixedRecordFile;
use crate::layout::{BlockRecord, Inout, TxRecordHeader};
use crate::txfile::TxFile;
use crate::StoreError;

/// Canonical file names inside a chainscan data directory.
pub mod files {
    use chainscan_primitives::script::AddressType;

    pub const BLOCKS: &str = "blocks.dat";
    pub const COINBASE: &str = "coinbase.dat";
    pub const TX_DATA: &str = "txdata.dat";
    pub const TX_INDEX: &str = "txindex.dat";
    pub const TX_HASHES: &str = "txhashes.dat";
    pub const SEQUENCE_DATA: &str = "sequence.dat";
    pub const SEQUENCE_INDEX: &str = "sequence_index.dat";
    pub const UTXO_CHECKPOINT: &str = "utxo_state.dat";
    pub const ADDRESS_CHECKPOINT: &str = "address_state.dat";
    pub const CHAIN_INDEX_CHECKPOINT: &str = "chain_index.dat";

    pub fn address_data(address_type: AddressType) -> String {
        format!("scripts_{}.dat", address_type.as_str())
    }

    pub fn address_index(address_type: AddressType) -> String {
        format!("scripts_{}_index.dat", address_type.as_str())
    }
}

pub struct ChainAccess {
    blocks: FixedRecordFile<BlockRecord>,
    tx_hashes: FixedRecordFile<Hash256>,
    coinbase: BlobFile,
    txs: TxFile,
}

/// A positioned transaction: the on-disk record plus its coordinates.
#[derive(Clone, Debug)]
pub struct TxView {
    pub tx_num: u64,
    pub block_height: u32,
    pub header: TxRecordHeader,
    inouts: Vec<Inout>,
}

/// One output slot with enough context to follow its links.
#[derive(Clone, Copy, Debug)]
pub struct OutputRef {
    pub tx_num: u64,
    pub index: u16,
    pub block_height: u32,
    pub inout: Inout,
}

/// One input slot; `inout.linked_tx_num` names the producing transaction.
#[derive(Clone, Copy, Debug)]
pub struct InputRef {
    pub tx_num: u64,
    pub index: u16,
    pub block_height: u32,
    pub inout: Inout,
}

impl TxView {
    pub fn is_coinbase(&self) -> bool {
        self.header.input_count == 0
    }

    pub fn input(&self, index: u16) -> Option<InputRef> {
        if index >= self.header.input_count {
            return None;
        }
        Some(InputRef {
            tx_num: self.tx_num,
            index,
            block_height: self.block_height,
            inout: self.inouts[index as usize],
        })
    }

    pub fn output(&self, index: u16) -> Option<OutputRef> {
        if index >= self.header.output_count {
            return None;
        }
        Some(OutputRef {
            tx_num: self.tx_num,
            index,
            block_height: self.block_height,
            inout: self.inouts[self.header.input_count as usize + index as usize],
        })
    }

    pub fn inputs(&self) -> impl Iterator<Item = InputRef> + '_ {
        (0..self.header.input_count).map(|i| self.input(i).expect("input in range"))
    }

    pub fn outputs(&self) -> impl Iterator<Item = OutputRef> + '_ {
        (0..self.header.output_count).map(|i| self.output(i).expect("output in range"))
    }
}

impl ChainAccess {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            blocks: FixedRecordFile::open(&dir.join(files::BLOCKS))?,
            tx_hashes: FixedRecordFile::open(&dir.join(files::TX_HASHES))?,
            coinbase: BlobFile::open(&dir.join(files::COINBASE))?,
            txs: TxFile::open(&dir.join(files::TX_DATA), &dir.join(files::TX_INDEX))?,
        })
    }

    /// Number of fully persisted blocks; heights `[0, max_height)` are
    /// readable.
    pub fn max_height(&self) -> u64 {
        self.blocks.count()
    }

    /// One past the last persisted `tx_num`.
    pub fn max_loaded_tx(&self) -> Result<u64, StoreError> {
        match self.blocks.last()? {
            Some(block) => Ok(block.first_tx_index as u64 + block.tx_count as u64),
            None => Ok(0),
        }
    }

    pub fn tip(&self) -> Result<Option<BlockRecord>, StoreError> {
        self.blocks.last()
    }

    pub fn block(&self, height: u64) -> Result<BlockRecord, StoreError> {
        self.blocks.get(height)
    }

    pub fn tx_hash(&self, tx_num: u64) -> Result<Hash256, StoreError> {
        self.tx_hashes.get(tx_num)
    }

    pub fn coinbase(&self, offset: u64) -> Result<Vec<u8>, StoreError> {
        self.coinbase.read_at(offset)
    }

    /// Height of the block containing `tx_num`, by upper-bound search
    /// over `first_tx_index`.
    pub fn block_height_of(&self, tx_num: u64) -> Result<u32, StoreError> {
        let count = self.blocks.count();
        if count == 0 || tx_num >= self.max_loaded_tx()? {
            return Err(StoreError::OutOfRange);
        }
        let mut lo = 0u64;
        let mut hi = count;
        // First block whose first_tx_index exceeds tx_num, minus one.
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.blocks.get(mid)?.first_tx_index as u64 <= tx_num {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok((lo - 1) as u32)
    }

    pub fn tx(&self, tx_num: u64) -> Result<TxView, StoreError> {
        let block_height = self.block_height_of(tx_num)?;
        let (header, inouts) = self.txs.read_record(tx_num)?;
        Ok(TxView {
            tx_num,
            block_height,
            header,
            inouts,
        })
    }
}
