//! The address registry: dense numeric IDs per script fingerprint,
//! partitioned by address type. Owned exclusively by the address stage.

use std::path::{Path, PathBuf};

use chainscan_primitives::encoding::{DecodeError, Decoder, Encoder};
use chainscan_primitives::script::{AddressType, ScriptOutput};
use chainscan_store::IndexedFile;

use crate::config::ParserConfig;
use crate::error::Error;
use crate::raw_tx::RawInput;

/// Transactions processed between checkpoint writes.
const SAVE_INTERVAL: u64 = 1_000_000;

struct Partition {
    ids: std::collections::HashMap<Vec<u8>, u32>,
    /// Next ID to hand out; numbering starts at 1 and survives resume.
    next_id: u32,
}

impl Partition {
    fn new() -> Self {
        Self {
            ids: std::collections::HashMap::new(),
            next_id: 1,
        }
    }
}

pub struct AddressState {
    partitions: [Partition; AddressType::ALL.len()],
    path: PathBuf,
    ops_since_save: u64,
    dirty: bool,
}

impl AddressState {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut state = Self {
            partitions: std::array::from_fn(|_| Partition::new()),
            path: path.to_path_buf(),
            ops_since_save: 0,
            dirty: false,
        };
        if path.exists() {
            let bytes = std::fs::read(path)?;
            state.decode(&bytes)?;
        }
        Ok(state)
    }

    pub fn max_address_num(&self, address_type: AddressType) -> u32 {
        self.partitions[address_type as usize].next_id.saturating_sub(1)
    }

    pub fn lookup(&self, address_type: AddressType, fingerprint: &[u8]) -> Option<u32> {
        self.partitions[address_type as usize]
            .ids
            .get(fingerprint)
            .copied()
    }

    /// Returns the fingerprint's ID in its type partition, allocating
    /// the next dense ID and appending the address record when unseen.
    fn resolve(
        &mut self,
        script_output: &ScriptOutput,
        creation_tx_num: u32,
        writer: &mut AddressWriter,
    ) -> Result<(u32, bool), Error> {
        self.dirty = true;
        self.ops_since_save += 1;
        let address_type = script_output.address_type();
        let partition = &mut self.partitions[address_type as usize];
        if let Some(&id) = partition.ids.get(script_output.fingerprint()) {
            return Ok((id, false));
        }
        let id = partition.next_id;
        partition.next_id += 1;
        partition
            .ids
            .insert(script_output.fingerprint().to_vec(), id);
        writer.append(address_type, script_output.fingerprint(), creation_tx_num)?;
        Ok((id, true))
    }

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
        for partition in &self.partitions {
            encoder.write_u32_le(partition.next_id);
            encoder.write_u64_le(partition.ids.len() as u64);
            for (fingerprint, id) in &partition.ids {
                encoder.write_var_bytes(fingerprint);
                encoder.write_u32_le(*id);
            }
        }
        std::fs::write(&self.path, encoder.into_inner())?;
        self.ops_since_save = 0;
        self.dirty = false;
        Ok(())
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut decoder = Decoder::new(bytes);
        for partition in &mut self.partitions {
            partition.next_id = decoder.read_u32_le()?;
            let count = decoder.read_u64_le()?;
            partition.ids.reserve(count as usize);
            for _ in 0..count {
                let fingerprint = decoder.read_var_bytes()?;
                let id = decoder.read_u32_le()?;
                partition.ids.insert(fingerprint, id);
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes.into());
        }
        Ok(())
    }
}

/// Appends `{creation_tx_num, payload}` records to the per-type
/// partition files; record `addressNum` lives at group `addressNum - 1`.
pub struct AddressWriter {
    files: Vec<IndexedFile>,
}

impl AddressWriter {
    pub fn open(config: &ParserConfig) -> Result<Self, Error> {
        let mut files = Vec::with_capacity(AddressType::ALL.len());
        for address_type in AddressType::ALL {
            files.push(IndexedFile::open(
                &config.address_file_path(address_type),
                &config.address_index_path(address_type),
            )?);
        }
        Ok(Self { files })
    }

    fn append(
        &mut self,
        address_type: AddressType,
        payload: &[u8],
        creation_tx_num: u32,
    ) -> Result<(), Error> {
        let file = &mut self.files[address_type as usize];
        file.begin_group()?;
        file.write(&creation_tx_num.to_le_bytes())?;
        file.write(payload)?;
        Ok(())
    }

    /// Reads back one address record: `(creation_tx_num, payload)`.
    pub fn get(
        &self,
        address_type: AddressType,
        address_num: u32,
    ) -> Result<(u32, Vec<u8>), Error> {
        let bytes = self.files[address_type as usize].get_group(address_num as u64 - 1)?;
        if bytes.len() < 4 {
            return Err(Error::Decode(DecodeError::UnexpectedEof));
        }
        let creation_tx_num = u32::from_le_bytes(bytes[0..4].try_into().expect("slice len"));
        Ok((creation_tx_num, bytes[4..].to_vec()))
    }

    pub fn count(&self, address_type: AddressType) -> u64 {
        self.files[address_type as usize].group_count()
    }

    /// Trims partition files down to the registry's counters, dropping
    /// records an interrupted run appended past its last checkpoint.
    pub fn align_to(&mut self, state: &AddressState) -> Result<(), Error> {
        for address_type in AddressType::ALL {
            self.files[address_type as usize]
                .truncate_groups(state.max_address_num(address_type) as u64)?;
        }
        Ok(())
    }
}

/// Assigns (or finds) the output script's address ID.
pub fn process_output(
    script_output: &ScriptOutput,
    tx_num: u32,
    state: &mut AddressState,
    writer: &mut AddressWriter,
) -> Result<u32, Error> {
    let (id, _) = state.resolve(script_output, tx_num, writer)?;
    Ok(id)
}

/// Inspects a spending input for a revealed wrapped script. When a
/// P2SH redeem script (or P2WSH witness script) surfaces for the first
/// time it is registered in its own partition, and the spent address's
/// ID is reported back so the caller can rescan what that address
/// guards.
pub fn process_input(
    input: &RawInput,
    spent_address_num: u32,
    spent_address_type: AddressType,
    tx_num: u32,
    state: &mut AddressState,
    writer: &mut AddressWriter,
    revealed: &mut Vec<u32>,
) -> Result<(), Error> {
    let wrapped = match spent_address_type {
        AddressType::ScriptHash => last_push(&input.script_sig),
        AddressType::WitnessScriptHash => input.witness.last().map(Vec::as_slice),
        _ => None,
    };
    let Some(wrapped) = wrapped else {
        return Ok(());
    };

    let wrapped_output = ScriptOutput::from_script(wrapped);
    let (_, newly_seen) = state.resolve(&wrapped_output, tx_num, writer)?;
    if newly_seen {
        revealed.push(spent_address_num);
    }
    Ok(())
}

/// Last data push of a script; push opcodes are the only ones carrying
/// immediates, everything else is skipped.
fn last_push(script: &[u8]) -> Option<&[u8]> {
    let mut cursor = 0usize;
    let mut last = None;
    while cursor < script.len() {
        let op = script[cursor];
        cursor += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            0x4c => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                len
            }
            0x4d => {
                let bytes = script.get(cursor..cursor + 2)?;
                cursor += 2;
                u16::from_le_bytes(bytes.try_into().ok()?) as usize
            }
            0x4e => {
                let bytes = script.get(cursor..cursor + 4)?;
                cursor += 4;
                u32::from_le_bytes(bytes.try_into().ok()?) as usize
            }
            _ => continue,
        };
        last = Some(script.get(cursor..cursor + len)?);
        cursor += len;
    }
    last
}
