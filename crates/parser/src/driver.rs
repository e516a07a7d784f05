//! The ingestion front door: chain index update, reorg detection,
//! watermark alignment, pipeline run, checkpointing.

use chainscan_log::{log_info, log_warn};
use chainscan_primitives::hash_to_hex;
use chainscan_primitives::Hash256;
use chainscan_store::{BlobFile, BlockRecord, FixedRecordFile, IndexedFile, TxFile};

use crate::address::{AddressState, AddressWriter};
use crate::chain_index::{BlockInfo, ChainIndex};
use crate::config::ParserConfig;
use crate::error::Error;
use crate::processor::{BlockProcessor, BlockSource};
use crate::rpc::RpcSource;
use crate::utxo::UtxoState;

#[derive(Clone, Debug, Default)]
pub struct IngestSummary {
    pub blocks_added: u64,
    pub txs_added: u64,
    /// Address IDs whose wrapped scripts were revealed by spends.
    pub revealed: Vec<u32>,
}

pub struct Parser {
    config: ParserConfig,
}

impl Parser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Ingests from `blkNNNNN.dat` container files.
    pub fn ingest_files(&self) -> Result<IngestSummary, Error> {
        self.ingest(BlockSource::Files)
    }

    /// Ingests from an upstream node's RPC interface.
    pub fn ingest_rpc(&self, rpc: &dyn RpcSource) -> Result<IngestSummary, Error> {
        self.ingest(BlockSource::Rpc(rpc))
    }

    fn ingest(&self, source: BlockSource<'_>) -> Result<IngestSummary, Error> {
        let config = &self.config;
        std::fs::create_dir_all(&config.data_dir)?;

        let mut chain_index = ChainIndex::load(&config.chain_index_checkpoint_path())?;
        match &source {
            BlockSource::Files => chain_index.update_from_files(config)?,
            BlockSource::Rpc(rpc) => chain_index.update_from_rpc(*rpc)?,
        }
        chain_index.save(&config.chain_index_checkpoint_path())?;

        let max_blocks = config.max_block_height;
        let chain = chain_index.generate_chain(max_blocks);

        let start_height = self.check_persisted_tip(&chain)?;
        let starting_tx_count = self.align_derived_files(start_height)?;

        let new_blocks: Vec<BlockInfo> = chain[start_height as usize..].to_vec();
        if new_blocks.is_empty() {
            log_info!("no new blocks; store is current at height {start_height}");
            return Ok(IngestSummary::default());
        }

        let blocks_added = new_blocks.len() as u64;
        let total_tx_count: u32 = new_blocks.iter().map(|block| block.tx_count).sum();
        let max_block_height = new_blocks.last().expect("non-empty").height as u32;
        log_info!(
            "ingesting {} block(s), {} transaction(s), heights {}..={}",
            new_blocks.len(),
            total_tx_count,
            new_blocks[0].height,
            max_block_height
        );

        let mut utxo = UtxoState::open(&config.utxo_checkpoint_path())?;
        let mut addresses = AddressState::open(&config.address_checkpoint_path())?;
        let mut address_writer = AddressWriter::open(config)?;
        address_writer.align_to(&addresses)?;

        let processor = BlockProcessor::new(starting_tx_count, total_tx_count, max_block_height);
        let revealed = processor.add_new_blocks(
            config,
            source,
            new_blocks,
            &mut utxo,
            &mut addresses,
            address_writer,
        )?;

        utxo.save()?;
        addresses.save()?;

        log_info!(
            "ingest complete: tip height {max_block_height}, {} live UTXO(s)",
            utxo.len()
        );
        Ok(IngestSummary {
            blocks_added,
            txs_added: total_tx_count as u64,
            revealed,
        })
    }

    /// Compares the persisted tip against the freshly generated chain.
    /// Returns the height ingestion starts at.
    fn check_persisted_tip(&self, chain: &[BlockInfo]) -> Result<u64, Error> {
        let block_file: FixedRecordFile<BlockRecord> =
            FixedRecordFile::open(&self.config.block_file_path())?;
        let Some(tip) = block_file.last()? else {
            return Ok(0);
        };

        let on_chain = chain
            .get(tip.height as usize)
            .map(|block| block.hash == tip.hash)
            .unwrap_or(false);
        if on_chain {
            return Ok(block_file.count());
        }

        if self.config.error_on_reorg {
            return Err(Error::Reorg { height: tip.height });
        }

        // Walk down to the highest height both sides agree on; the
        // divergent suffix is dropped and re-ingested from there.
        let mut height = (tip.height as usize).min(chain.len().saturating_sub(1));
        loop {
            let persisted: Hash256 = block_file.get(height as u64)?.hash;
            if chain[height].hash == persisted {
                log_warn!(
                    "reorg past height {height} (tip was {}); re-ingesting the divergent suffix",
                    hash_to_hex(&tip.hash)
                );
                return Ok(height as u64 + 1);
            }
            if height == 0 {
                log_warn!("reorg back to genesis; re-ingesting the whole chain");
                return Ok(0);
            }
            height -= 1;
        }
    }

    /// Trims the transaction-indexed files back to the block-file
    /// watermark so an interrupted run's partial tail never skews
    /// record numbering.
    fn align_derived_files(&self, start_height: u64) -> Result<u32, Error> {
        let config = &self.config;
        let mut block_file: FixedRecordFile<BlockRecord> =
            FixedRecordFile::open(&config.block_file_path())?;
        // A no-op unless a reorg moved the start below the persisted
        // tip, in which case the divergent suffix is discarded.
        block_file.truncate(start_height)?;

        let (tx_watermark, coinbase_watermark) = if start_height == 0 {
            (0u64, 0u64)
        } else {
            let tip = block_file.get(start_height - 1)?;
            let coinbase = BlobFile::open(&config.coinbase_file_path())?;
            let tip_coinbase = coinbase.read_at(tip.coinbase_offset)?;
            (
                tip.first_tx_index as u64 + tip.tx_count as u64,
                tip.coinbase_offset + 4 + tip_coinbase.len() as u64,
            )
        };

        let mut hash_file: FixedRecordFile<Hash256> =
            FixedRecordFile::open(&config.tx_hashes_path())?;
        hash_file.truncate(tx_watermark)?;

        let tx_file = TxFile::open(&config.tx_file_path(), &config.tx_index_path())?;
        tx_file.truncate(tx_watermark)?;

        let mut sequence_file =
            IndexedFile::open(&config.sequence_file_path(), &config.sequence_index_path())?;
        sequence_file.truncate_groups(tx_watermark)?;

        let mut coinbase_file = BlobFile::open(&config.coinbase_file_path())?;
        coinbase_file.truncate(coinbase_watermark)?;

        Ok(tx_watermark as u32)
    }
}
