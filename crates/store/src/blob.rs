//! Length-prefixed blob file, addressed by byte offset.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::StoreError;

pub struct BlobFile {
    file: File,
    len: u64,
}

impl BlobFile {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Current end of file; the offset the next append will land at.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, StoreError> {
        let offset = self.len;
        let mut framed = Vec::with_capacity(4 + bytes.len());
        framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        framed.extend_from_slice(bytes);
        self.file.write_all_at(&framed, offset)?;
        self.len += framed.len() as u64;
        Ok(offset)
    }

    /// Drops bytes past `len`; trims partial trailing data left by an
    /// interrupted run.
    pub fn truncate(&mut self, len: u64) -> Result<(), StoreError> {
        if len >= self.len {
            return Ok(());
        }
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    pub fn read_at(&self, offset: u64) -> Result<Vec<u8>, StoreError> {
        if offset + 4 > self.len {
            return Err(StoreError::OutOfRange);
        }
        let mut len_bytes = [0u8; 4];
        self.file.read_exact_at(&mut len_bytes, offset)?;
        let len = u32::from_le_bytes(len_bytes) as u64;
        if offset + 4 + len > self.len {
            return Err(StoreError::Corrupt("blob extends past end of file"));
        }
        let mut bytes = vec![0u8; len as usize];
        self.file.read_exact_at(&mut bytes, offset + 4)?;
        Ok(bytes)
    }
}
