//! Variable-length record groups with a `u64` offset sidecar.
//!
//! Group `i` occupies `[offsets[i], offsets[i+1])` in the data file
//! (the last group runs to end of file). Backs the per-transaction
//! sequence-number groups and the per-type address partitions.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::StoreError;

pub struct IndexedFile {
    data: File,
    index: File,
    offsets: Vec<u64>,
    data_len: u64,
}

impl IndexedFile {
    pub fn open(data_path: &Path, index_path: &Path) -> Result<Self, StoreError> {
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(data_path)?;
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(index_path)?;

        let index_len = index.metadata()?.len();
        if index_len % 8 != 0 {
            return Err(StoreError::Corrupt("offset sidecar length misaligned"));
        }
        let mut offsets = Vec::with_capacity((index_len / 8) as usize);
        let mut buf = vec![0u8; index_len as usize];
        index.read_exact_at(&mut buf, 0)?;
        for chunk in buf.chunks_exact(8) {
            offsets.push(u64::from_le_bytes(chunk.try_into().expect("chunk len")));
        }

        let data_len = data.metadata()?.len();
        if let Some(&last) = offsets.last() {
            if last > data_len {
                return Err(StoreError::Corrupt("offset sidecar past end of data"));
            }
        }

        Ok(Self {
            data,
            index,
            offsets,
            data_len,
        })
    }

    pub fn group_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// Starts a new group at the current end of the data file.
    pub fn begin_group(&mut self) -> Result<(), StoreError> {
        let offset = self.data_len;
        self.index
            .write_all_at(&offset.to_le_bytes(), self.offsets.len() as u64 * 8)?;
        self.offsets.push(offset);
        Ok(())
    }

    /// Appends bytes to the currently open group.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if self.offsets.is_empty() {
            return Err(StoreError::Corrupt("write before begin_group"));
        }
        self.data.write_all_at(bytes, self.data_len)?;
        self.data_len += bytes.len() as u64;
        Ok(())
    }

    /// Drops groups past `count`; trims partial trailing data left by
    /// an interrupted run.
    pub fn truncate_groups(&mut self, count: u64) -> Result<(), StoreError> {
        let count = count as usize;
        if count >= self.offsets.len() {
            return Ok(());
        }
        let data_len = self.offsets[count];
        self.data.set_len(data_len)?;
        self.index.set_len(count as u64 * 8)?;
        self.offsets.truncate(count);
        self.data_len = data_len;
        Ok(())
    }

    pub fn get_group(&self, group: u64) -> Result<Vec<u8>, StoreError> {
        let group = group as usize;
        let start = *self.offsets.get(group).ok_or(StoreError::OutOfRange)?;
        let end = self
            .offsets
            .get(group + 1)
            .copied()
            .unwrap_or(self.data_len);
        let mut bytes = vec![0u8; (end - start) as usize];
        self.data.read_exact_at(&mut bytes, start)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_roundtrip_and_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_path = dir.path().join("seq.dat");
        let index_path = dir.path().join("seq_index.dat");

        let mut file = IndexedFile::open(&data_path, &index_path).expect("open");
        file.begin_group().expect("group");
        file.write(&1u32.to_le_bytes()).expect("write");
        file.write(&2u32.to_le_bytes()).expect("write");
        file.begin_group().expect("group");
        file.begin_group().expect("group");
        file.write(&3u32.to_le_bytes()).expect("write");
        drop(file);

        let reopened = IndexedFile::open(&data_path, &index_path).expect("reopen");
        assert_eq!(reopened.group_count(), 3);
        let first = reopened.get_group(0).expect("get");
        assert_eq!(first.len(), 8);
        assert_eq!(reopened.get_group(1).expect("get"), Vec::<u8>::new());
        assert_eq!(reopened.get_group(2).expect("get"), 3u32.to_le_bytes());
        assert!(reopened.get_group(3).is_err());
    }

    #[test]
    fn write_without_group_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = IndexedFile::open(
            &dir.path().join("data.dat"),
            &dir.path().join("index.dat"),
        )
        .expect("open");
        assert!(file.write(&[1]).is_err());
    }
}
