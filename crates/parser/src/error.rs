//! Pipeline error kinds.

use std::fmt;
use std::path::PathBuf;

use chainscan_primitives::encoding::DecodeError;
use chainscan_primitives::hash_to_hex;
use chainscan_primitives::outpoint::OutPoint;
use chainscan_store::StoreError;

#[derive(Debug)]
pub enum Error {
    /// Bad magic, truncated block, or inconsistent counts in a block
    /// container file. Partially written records stay on disk.
    CorruptBlockFile {
        path: PathBuf,
        offset: u64,
        reason: DecodeError,
    },
    /// An input referenced an output absent from the UTXO set.
    UtxoMiss { outpoint: OutPoint },
    /// An output was created twice; indicates corruption or
    /// out-of-order ingest.
    DuplicateUtxo { outpoint: OutPoint },
    /// The persisted tip is no longer on the upstream chain.
    Reorg { height: u32 },
    Io(std::io::Error),
    Store(StoreError),
    Decode(DecodeError),
    Rpc(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CorruptBlockFile {
                path,
                offset,
                reason,
            } => write!(
                f,
                "corrupt block file {} at offset {offset}: {reason}",
                path.display()
            ),
            Error::UtxoMiss { outpoint } => write!(
                f,
                "missing UTXO {}:{}",
                hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            Error::DuplicateUtxo { outpoint } => write!(
                f,
                "duplicate UTXO {}:{}",
                hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            Error::Reorg { height } => {
                write!(f, "persisted chain diverges from upstream at height {height}")
            }
            Error::Io(err) => write!(f, "{err}"),
            Error::Store(err) => write!(f, "{err}"),
            Error::Decode(err) => write!(f, "{err}"),
            Error::Rpc(message) => write!(f, "rpc failure: {message}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}
