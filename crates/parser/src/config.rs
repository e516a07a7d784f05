//! Parser configuration, threaded explicitly through constructors.

use std::path::{Path, PathBuf};

use chainscan_primitives::script::AddressType;
use chainscan_store::access::files;

/// Mainnet block container magic.
pub const MAINNET_MAGIC: u32 = 0xd9b4_bef9;

#[derive(Clone, Debug)]
pub struct ParserConfig {
    /// Output directory for the columnar store and checkpoints.
    pub data_dir: PathBuf,
    /// Directory holding `blkNNNNN.dat` container files (file mode).
    pub blocks_dir: PathBuf,
    /// Network magic framing each block in the container files.
    pub block_magic: u32,
    /// Stop after this height when set.
    pub max_block_height: Option<u32>,
    /// Abort with `Error::Reorg` instead of re-ingesting from the
    /// split point.
    pub error_on_reorg: bool,
}

impl ParserConfig {
    pub fn new(data_dir: impl Into<PathBuf>, blocks_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            blocks_dir: blocks_dir.into(),
            block_magic: MAINNET_MAGIC,
            max_block_height: None,
            error_on_reorg: true,
        }
    }

    pub fn path_for_block_file(&self, file_num: u32) -> PathBuf {
        self.blocks_dir.join(format!("blk{file_num:05}.dat"))
    }

    pub fn block_file_path(&self) -> PathBuf {
        self.data_dir.join(files::BLOCKS)
    }

    pub fn coinbase_file_path(&self) -> PathBuf {
        self.data_dir.join(files::COINBASE)
    }

    pub fn tx_file_path(&self) -> PathBuf {
        self.data_dir.join(files::TX_DATA)
    }

    pub fn tx_index_path(&self) -> PathBuf {
        self.data_dir.join(files::TX_INDEX)
    }

    pub fn tx_hashes_path(&self) -> PathBuf {
        self.data_dir.join(files::TX_HASHES)
    }

    pub fn sequence_file_path(&self) -> PathBuf {
        self.data_dir.join(files::SEQUENCE_DATA)
    }

    pub fn sequence_index_path(&self) -> PathBuf {
        self.data_dir.join(files::SEQUENCE_INDEX)
    }

    pub fn address_file_path(&self, address_type: AddressType) -> PathBuf {
        self.data_dir.join(files::address_data(address_type))
    }

    pub fn address_index_path(&self, address_type: AddressType) -> PathBuf {
        self.data_dir.join(files::address_index(address_type))
    }

    pub fn utxo_checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(files::UTXO_CHECKPOINT)
    }

    pub fn address_checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(files::ADDRESS_CHECKPOINT)
    }

    pub fn chain_index_checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(files::CHAIN_INDEX_CHECKPOINT)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
