//! Upstream RPC interface.
//!
//! The parser consumes exactly four calls; transports live outside this
//! crate and tests supply an in-memory implementation.

use chainscan_primitives::block::BlockHeader;
use chainscan_primitives::Hash256;

use crate::error::Error;

/// A `getblock` response reduced to what ingestion needs.
#[derive(Clone, Debug)]
pub struct RpcBlock {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub size: u32,
    pub tx_ids: Vec<Hash256>,
}

pub trait RpcSource: Send + Sync {
    /// `getblockcount`: number of blocks on the upstream chain.
    fn block_count(&self) -> Result<u32, Error>;
    /// `getblockhash`
    fn block_hash(&self, height: u32) -> Result<Hash256, Error>;
    /// `getblock`
    fn block(&self, hash: &Hash256) -> Result<RpcBlock, Error>;
    /// `getrawtransaction`: raw wire bytes.
    fn raw_transaction(&self, txid: &Hash256) -> Result<Vec<u8>, Error>;
}
