//! The columnar on-disk store.
//!
//! All files are little-endian and laid out for memory mapping: fixed
//! records addressed by index, variable records addressed through a
//! `u64` offset sidecar, and length-prefixed blobs addressed by byte
//! offset.

use std::fmt;

pub mod access;
pub mod blob;
pub mod fixed;
pub mod indexed;
pub mod layout;
pub mod txfile;

pub use access::ChainAccess;
pub use blob::BlobFile;
pub use fixed::{FixedRecord, FixedRecordFile};
pub use indexed::IndexedFile;
pub use layout::{BlockRecord, Inout, TxRecordHeader};
pub use txfile::TxFile;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Corrupt(&'static str),
    OutOfRange,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "{err}"),
            StoreError::Corrupt(message) => write!(f, "{message}"),
            StoreError::OutOfRange => write!(f, "record index out of range"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}
