//! Pooled mutable transaction records passed between pipeline stages.
//!
//! A `RawTransaction` is loaded by the reader stage, hashed by the hash
//! stage, annotated by the UTXO stage, and retired (or recycled through
//! the free list) by the address stage. `load` reuses the buffers of a
//! recycled record.

use chainscan_primitives::encoding::{DecodeError, Decoder, Encoder};
use chainscan_primitives::hash::sha256d;
use chainscan_primitives::outpoint::OutPoint;
use chainscan_primitives::script::{AddressType, ScriptOutput};
use chainscan_primitives::{Hash256, NULL_HASH};

#[derive(Clone, Debug)]
pub struct RawInput {
    pub prev_outpoint: OutPoint,
    pub script_sig: Vec<u8>,
    pub witness: Vec<Vec<u8>>,
    pub sequence: u32,
    /// Populated by the UTXO stage.
    pub address_type: AddressType,
    /// Producing transaction, populated by the UTXO stage.
    pub linked_tx_num: u32,
}

#[derive(Clone, Debug)]
pub struct RawOutput {
    pub value: u64,
    pub script_output: ScriptOutput,
}

#[derive(Debug)]
pub struct RawTransaction {
    pub tx_num: u32,
    pub block_height: u32,
    pub size_bytes: u32,
    pub locktime: u32,
    pub version: i32,
    pub is_segwit: bool,
    pub hash: Hash256,
    pub inputs: Vec<RawInput>,
    pub outputs: Vec<RawOutput>,
    /// True once the reader stripped the coinbase input.
    pub is_coinbase: bool,
    /// The stripped coinbase input, kept so the canonical hash still
    /// covers it.
    pub coinbase_script: Vec<u8>,
    pub coinbase_sequence: u32,
}

impl Default for RawTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTransaction {
    pub fn new() -> Self {
        Self {
            tx_num: 0,
            block_height: 0,
            size_bytes: 0,
            locktime: 0,
            version: 0,
            is_segwit: false,
            hash: NULL_HASH,
            inputs: Vec::new(),
            outputs: Vec::new(),
            is_coinbase: false,
            coinbase_script: Vec::new(),
            coinbase_sequence: 0,
        }
    }

    /// Parses one wire-format transaction, reusing this record's
    /// buffers. Witness serialization is detected from the BIP-141
    /// marker; `segwit_active` is the block-level activation flag that
    /// ends up on disk.
    pub fn load(
        &mut self,
        decoder: &mut Decoder,
        tx_num: u32,
        block_height: u32,
        segwit_active: bool,
    ) -> Result<(), DecodeError> {
        let start = decoder.position();

        self.tx_num = tx_num;
        self.block_height = block_height;
        self.hash = NULL_HASH;
        self.inputs.clear();
        self.outputs.clear();
        self.is_coinbase = false;
        self.coinbase_script.clear();
        self.coinbase_sequence = 0;
        self.is_segwit = segwit_active;

        self.version = decoder.read_i32_le()?;

        let mut has_witness = false;
        let mut input_count = decoder.read_varint()?;
        if input_count == 0 {
            // No real transaction has zero inputs; this is the BIP-141
            // marker and the next byte must be the 0x01 flag.
            let flag = decoder.read_u8()?;
            if flag != 0x01 {
                return Err(DecodeError::InvalidData("invalid segwit flag"));
            }
            has_witness = true;
            input_count = decoder.read_varint()?;
        }

        for _ in 0..input_count {
            let hash = decoder.read_hash_le()?;
            let index = decoder.read_u32_le()?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            self.inputs.push(RawInput {
                prev_outpoint: OutPoint::new(hash, index),
                script_sig,
                witness: Vec::new(),
                sequence,
                address_type: AddressType::Nonstandard,
                linked_tx_num: 0,
            });
        }

        let output_count = decoder.read_varint()?;
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script = decoder.read_var_bytes()?;
            self.outputs.push(RawOutput {
                value: value as u64,
                script_output: ScriptOutput::from_script(&script),
            });
        }

        if has_witness {
            for input in &mut self.inputs {
                let items = decoder.read_varint()?;
                input.witness.clear();
                for _ in 0..items {
                    input.witness.push(decoder.read_var_bytes()?);
                }
            }
        }

        self.locktime = decoder.read_u32_le()?;
        self.size_bytes = (decoder.position() - start) as u32;
        Ok(())
    }

    /// Detects the coinbase shape before the reader strips it.
    pub fn has_coinbase_input(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_outpoint.is_null()
    }

    /// Moves the coinbase input out of the input list, returning its
    /// script bytes for the coinbase file.
    pub fn strip_coinbase_input(&mut self) -> Vec<u8> {
        debug_assert!(self.has_coinbase_input());
        let input = self.inputs.pop().expect("coinbase input");
        self.is_coinbase = true;
        self.coinbase_script = input.script_sig.clone();
        self.coinbase_sequence = input.sequence;
        input.script_sig
    }

    /// The canonical (non-witness) serialization: what `sha256d` runs
    /// over for the transaction id. A stripped coinbase input is
    /// serialized back in place.
    pub fn write_non_witness(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        if self.is_coinbase {
            encoder.write_varint(1);
            encoder.write_hash_le(&NULL_HASH);
            encoder.write_u32_le(u32::MAX);
            encoder.write_var_bytes(&self.coinbase_script);
            encoder.write_u32_le(self.coinbase_sequence);
        } else {
            encoder.write_varint(self.inputs.len() as u64);
            for input in &self.inputs {
                encoder.write_hash_le(&input.prev_outpoint.hash);
                encoder.write_u32_le(input.prev_outpoint.index);
                encoder.write_var_bytes(&input.script_sig);
                encoder.write_u32_le(input.sequence);
            }
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value as i64);
            encoder.write_var_bytes(&output.script_output.script_bytes());
        }
        encoder.write_u32_le(self.locktime);
    }

    pub fn compute_hash(&mut self) -> Hash256 {
        let mut encoder = Encoder::with_capacity(self.size_bytes as usize);
        self.write_non_witness(&mut encoder);
        self.hash = sha256d(&encoder.into_inner());
        self.hash
    }
}
