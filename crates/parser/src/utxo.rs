//! The live unspent-output set, owned exclusively by the UTXO stage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chainscan_primitives::encoding::{DecodeError, Decoder, Encoder};
use chainscan_primitives::outpoint::OutPoint;
use chainscan_primitives::script::AddressType;

use crate::error::Error;

/// Transactions processed between checkpoint writes.
const SAVE_INTERVAL: u64 = 1_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub producing_tx_num: u32,
    pub value: u64,
    pub address_type: AddressType,
    /// The output script's registry fingerprint.
    pub fingerprint: Vec<u8>,
}

pub struct UtxoState {
    map: HashMap<OutPoint, UtxoEntry>,
    path: PathBuf,
    ops_since_save: u64,
    dirty: bool,
}

impl UtxoState {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut state = Self {
            map: HashMap::new(),
            path: path.to_path_buf(),
            ops_since_save: 0,
            dirty: false,
        };
        if path.exists() {
            let bytes = std::fs::read(path)?;
            state.map = decode_map(&bytes)?;
        }
        Ok(state)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.map.contains_key(outpoint)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.map.get(outpoint)
    }

    /// Removes and returns the output an input spends. A miss means
    /// corruption or out-of-order ingest and aborts the run.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<UtxoEntry, Error> {
        self.dirty = true;
        self.ops_since_save += 1;
        self.map
            .remove(outpoint)
            .ok_or(Error::UtxoMiss { outpoint: *outpoint })
    }

    /// Registers a newly created spendable output. Creating the same
    /// outpoint twice is fatal.
    pub fn add(&mut self, outpoint: OutPoint, entry: UtxoEntry) -> Result<(), Error> {
        self.dirty = true;
        self.ops_since_save += 1;
        if self.map.insert(outpoint, entry).is_some() {
            return Err(Error::DuplicateUtxo { outpoint });
        }
        Ok(())
    }

    /// Checkpoints when enough work has accumulated since the last one.
    pub fn optional_save(&mut self) -> Result<(), Error> {
        if self.ops_since_save >= SAVE_INTERVAL {
            self.save()?;
        }
        Ok(())
    }

    pub fn save(&mut self) -> Result<(), Error> {
        if !self.dirty {
            self.ops_since_save = 0;
            return Ok(());
        }
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.map.len() as u64);
        for (outpoint, entry) in &self.map {
            encoder.write_hash_le(&outpoint.hash);
            encoder.write_u32_le(outpoint.index);
            encoder.write_u32_le(entry.producing_tx_num);
            encoder.write_u64_le(entry.value);
            encoder.write_u8(entry.address_type as u8);
            encoder.write_var_bytes(&entry.fingerprint);
        }
        std::fs::write(&self.path, encoder.into_inner())?;
        self.ops_since_save = 0;
        self.dirty = false;
        Ok(())
    }
}

fn decode_map(bytes: &[u8]) -> Result<HashMap<OutPoint, UtxoEntry>, Error> {
    let mut decoder = Decoder::new(bytes);
    let count = decoder.read_u64_le()?;
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let hash = decoder.read_hash_le()?;
        let index = decoder.read_u32_le()?;
        let producing_tx_num = decoder.read_u32_le()?;
        let value = decoder.read_u64_le()?;
        let address_type = AddressType::from_u8(decoder.read_u8()?)
            .ok_or(DecodeError::InvalidData("unknown address type"))?;
        let fingerprint = decoder.read_var_bytes()?;
        map.insert(
            OutPoint::new(hash, index),
            UtxoEntry {
                producing_tx_num,
                value,
                address_type,
                fingerprint,
            },
        );
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes.into());
    }
    Ok(map)
}
