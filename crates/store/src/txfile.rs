//! The indexed transaction file.
//!
//! Written append-only by the UTXO stage and patched in place by the
//! address stage. Appends accumulate in an internal buffer; any read or
//! patch that touches bytes past the flushed watermark forces a flush
//! first, so a patcher can never observe a half-visible record.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use crate::layout::{
    Inout, TxRecordHeader, INOUT_LEN, INOUT_LINKED_TX_NUM_OFFSET, INOUT_TO_ADDRESS_NUM_OFFSET,
    TX_RECORD_HEADER_LEN,
};
use crate::StoreError;

const APPEND_BUF_FLUSH_LEN: usize = 1 << 20;

pub struct TxFile {
    inner: Mutex<TxFileInner>,
}

struct TxFileInner {
    data: File,
    index: File,
    offsets: Vec<u64>,
    /// Bytes durably handed to the OS.
    flushed_len: u64,
    /// Bytes appended, including those still in `pending`.
    data_len: u64,
    pending: Vec<u8>,
}

impl TxFile {
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
            return Err(StoreError::Corrupt("tx offset sidecar misaligned"));
        }
        let mut offsets = Vec::with_capacity((index_len / 8) as usize);
        let mut buf = vec![0u8; index_len as usize];
        index.read_exact_at(&mut buf, 0)?;
        for chunk in buf.chunks_exact(8) {
            offsets.push(u64::from_le_bytes(chunk.try_into().expect("chunk len")));
        }

        // The sidecar is written ahead of the buffered data file, so an
        // interrupted run can leave offsets pointing past the end.
        // Records are never empty, so anything at or past EOF is a
        // partial tail to drop.
        let data_len = data.metadata()?.len();
        while offsets.last().is_some_and(|&last| last >= data_len) {
            offsets.pop();
        }
        index.set_len(offsets.len() as u64 * 8)?;

        Ok(Self {
            inner: Mutex::new(TxFileInner {
                data,
                index,
                offsets,
                flushed_len: data_len,
                data_len,
                pending: Vec::with_capacity(APPEND_BUF_FLUSH_LEN),
            }),
        })
    }

    pub fn tx_count(&self) -> u64 {
        self.inner.lock().expect("tx file lock").offsets.len() as u64
    }

    /// Appends one full transaction record (header plus every inout).
    pub fn append_tx(&self, header: &TxRecordHeader, inouts: &[Inout]) -> Result<u64, StoreError> {
        debug_assert_eq!(
            header.input_count as usize + header.output_count as usize,
            inouts.len()
        );
        let mut inner = self.inner.lock().expect("tx file lock");

        let tx_num = inner.offsets.len() as u64;
        let offset = inner.data_len;
        inner.index.write_all_at(&offset.to_le_bytes(), tx_num * 8)?;
        inner.offsets.push(offset);

        let mut header_bytes = [0u8; TX_RECORD_HEADER_LEN];
        header.encode(&mut header_bytes);
        inner.pending.extend_from_slice(&header_bytes);
        let mut inout_bytes = [0u8; INOUT_LEN];
        for inout in inouts {
            inout.encode(&mut inout_bytes);
            inner.pending.extend_from_slice(&inout_bytes);
        }
        inner.data_len += (TX_RECORD_HEADER_LEN + inouts.len() * INOUT_LEN) as u64;

        if inner.pending.len() >= APPEND_BUF_FLUSH_LEN {
            inner.flush_pending()?;
        }
        Ok(tx_num)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.inner.lock().expect("tx file lock").flush_pending()
    }

    /// Drops records past `count`; trims partial trailing data left by
    /// an interrupted run.
    pub fn truncate(&self, count: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("tx file lock");
        inner.flush_pending()?;
        let count = count as usize;
        if count >= inner.offsets.len() {
            return Ok(());
        }
        let data_len = inner.offsets[count];
        inner.data.set_len(data_len)?;
        inner.index.set_len(count as u64 * 8)?;
        inner.offsets.truncate(count);
        inner.data_len = data_len;
        inner.flushed_len = data_len;
        Ok(())
    }

    pub fn read_header(&self, tx_num: u64) -> Result<TxRecordHeader, StoreError> {
        let mut inner = self.inner.lock().expect("tx file lock");
        let offset = inner.record_visible(tx_num)?;
        let mut bytes = [0u8; TX_RECORD_HEADER_LEN];
        inner.data.read_exact_at(&mut bytes, offset)?;
        TxRecordHeader::decode(&bytes).ok_or(StoreError::Corrupt("undecodable tx header"))
    }

    pub fn read_input(&self, tx_num: u64, input_index: u16) -> Result<Inout, StoreError> {
        let mut inner = self.inner.lock().expect("tx file lock");
        let offset = inner.input_offset(tx_num, input_index)?;
        inner.read_inout(offset)
    }

    pub fn read_output(&self, tx_num: u64, output_index: u16) -> Result<Inout, StoreError> {
        let mut inner = self.inner.lock().expect("tx file lock");
        let offset = inner.output_offset(tx_num, output_index)?;
        inner.read_inout(offset)
    }

    /// Resolves an input's spent address once the address stage knows it.
    pub fn patch_input_to_address(
        &self,
        tx_num: u64,
        input_index: u16,
        address_num: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("tx file lock");
        let offset = inner.input_offset(tx_num, input_index)?;
        inner.data.write_all_at(
            &address_num.to_le_bytes(),
            offset + INOUT_TO_ADDRESS_NUM_OFFSET,
        )?;
        Ok(())
    }

    pub fn patch_output_to_address(
        &self,
        tx_num: u64,
        output_index: u16,
        address_num: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("tx file lock");
        let offset = inner.output_offset(tx_num, output_index)?;
        inner.data.write_all_at(
            &address_num.to_le_bytes(),
            offset + INOUT_TO_ADDRESS_NUM_OFFSET,
        )?;
        Ok(())
    }

    /// Finalizes the spent-by back-pointer on a producing output.
    pub fn patch_output_spent_by(
        &self,
        tx_num: u64,
        output_index: u16,
        spending_tx_num: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("tx file lock");
        let offset = inner.output_offset(tx_num, output_index)?;
        inner.data.write_all_at(
            &spending_tx_num.to_le_bytes(),
            offset + INOUT_LINKED_TX_NUM_OFFSET,
        )?;
        Ok(())
    }

    /// Reads one whole record; the read side and tests use this.
    pub fn read_record(&self, tx_num: u64) -> Result<(TxRecordHeader, Vec<Inout>), StoreError> {
        let header = self.read_header(tx_num)?;
        let mut inner = self.inner.lock().expect("tx file lock");
        let start = inner.record_visible(tx_num)?;
        let total = header.input_count as usize + header.output_count as usize;
        let mut inouts = Vec::with_capacity(total);
        for slot in 0..total {
            let offset = start + TX_RECORD_HEADER_LEN as u64 + (slot * INOUT_LEN) as u64;
            inouts.push(inner.read_inout(offset)?);
        }
        Ok((header, inouts))
    }
}

impl TxFileInner {
    fn flush_pending(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.data.write_all_at(&self.pending, self.flushed_len)?;
        self.flushed_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Returns the record's start offset, flushing if any of it is still
    /// buffered.
    fn record_visible(&mut self, tx_num: u64) -> Result<u64, StoreError> {
        let index = tx_num as usize;
        let start = *self.offsets.get(index).ok_or(StoreError::OutOfRange)?;
        let end = self
            .offsets
            .get(index + 1)
            .copied()
            .unwrap_or(self.data_len);
        if end > self.flushed_len {
            self.flush_pending()?;
        }
        Ok(start)
    }

    fn input_offset(&mut self, tx_num: u64, input_index: u16) -> Result<u64, StoreError> {
        let start = self.record_visible(tx_num)?;
        let header = self.header_at(start)?;
        if input_index >= header.input_count {
            return Err(StoreError::OutOfRange);
        }
        Ok(start + TX_RECORD_HEADER_LEN as u64 + input_index as u64 * INOUT_LEN as u64)
    }

    fn output_offset(&mut self, tx_num: u64, output_index: u16) -> Result<u64, StoreError> {
        let start = self.record_visible(tx_num)?;
        let header = self.header_at(start)?;
        if output_index >= header.output_count {
            return Err(StoreError::OutOfRange);
        }
        let slot = header.input_count as u64 + output_index as u64;
        Ok(start + TX_RECORD_HEADER_LEN as u64 + slot * INOUT_LEN as u64)
    }

    fn header_at(&self, offset: u64) -> Result<TxRecordHeader, StoreError> {
        let mut bytes = [0u8; TX_RECORD_HEADER_LEN];
        self.data.read_exact_at(&mut bytes, offset)?;
        TxRecordHeader::decode(&bytes).ok_or(StoreError::Corrupt("undecodable tx header"))
    }

    fn read_inout(&self, offset: u64) -> Result<Inout, StoreError> {
        let mut bytes = [0u8; INOUT_LEN];
        self.data.read_exact_at(&mut bytes, offset)?;
        Inout::decode(&bytes).ok_or(StoreError::Corrupt("undecodable inout"))
    }
}
