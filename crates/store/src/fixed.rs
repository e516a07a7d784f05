//! Fixed-size record file, addressed by record index.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::StoreError;

pub trait FixedRecord: Sized {
    const LEN: usize;

    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Option<Self>;
}

pub struct FixedRecordFile<R> {
    file: File,
    count: u64,
    _marker: PhantomData<R>,
}

impl<R: FixedRecord> FixedRecordFile<R> {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % R::LEN as u64 != 0 {
            return Err(StoreError::Corrupt("fixed record file length misaligned"));
        }
        Ok(Self {
            file,
            count: len / R::LEN as u64,
            _marker: PhantomData,
        })
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn append(&mut self, record: &R) -> Result<(), StoreError> {
        let mut bytes = vec![0u8; R::LEN];
        record.encode(&mut bytes);
        self.file.write_all_at(&bytes, self.count * R::LEN as u64)?;
        self.count += 1;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<R, StoreError> {
        if index >= self.count {
            return Err(StoreError::OutOfRange);
        }
        let mut bytes = vec![0u8; R::LEN];
        self.file.read_exact_at(&mut bytes, index * R::LEN as u64)?;
        R::decode(&bytes).ok_or(StoreError::Corrupt("undecodable fixed record"))
    }

    pub fn last(&self) -> Result<Option<R>, StoreError> {
        if self.count == 0 {
            return Ok(None);
        }
        self.get(self.count - 1).map(Some)
    }

    /// Drops records past `count`; trims partial trailing data left by
    /// an interrupted run.
    pub fn truncate(&mut self, count: u64) -> Result<(), StoreError> {
        if count >= self.count {
            return Ok(());
        }
        self.file.set_len(count * R::LEN as u64)?;
        self.count = count;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        a: u32,
        b: u32,
    }

    impl FixedRecord for Pair {
        const LEN: usize = 8;

        fn encode(&self, out: &mut [u8]) {
            out[0..4].copy_from_slice(&self.a.to_le_bytes());
            out[4..8].copy_from_slice(&self.b.to_le_bytes());
        }

        fn decode(bytes: &[u8]) -> Option<Self> {
            Some(Self {
                a: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
                b: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            })
        }
    }

    #[test]
    fn append_get_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pairs.dat");

        let mut file = FixedRecordFile::<Pair>::open(&path).expect("open");
        file.append(&Pair { a: 1, b: 2 }).expect("append");
        file.append(&Pair { a: 3, b: 4 }).expect("append");
        assert_eq!(file.count(), 2);
        assert_eq!(file.get(1).expect("get"), Pair { a: 3, b: 4 });
        assert!(matches!(file.get(2), Err(StoreError::OutOfRange)));
        drop(file);

        let reopened = FixedRecordFile::<Pair>::open(&path).expect("reopen");
        assert_eq!(reopened.count(), 2);
        assert_eq!(reopened.get(0).expect("get"), Pair { a: 1, b: 2 });
    }
}
