//! Counts-only transaction scan used while indexing block files.
//!
//! The chain index only needs input/output totals per block, so this
//! walks the wire format without materializing scripts or witnesses.
//! Full parsing into pooled records happens in the parser crate.

use crate::encoding::{DecodeError, Decoder};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransactionHeader {
    pub version: i32,
    pub input_count: u32,
    pub output_count: u32,
    pub is_segwit: bool,
    /// Serialized size in bytes, witness included.
    pub size_bytes: u32,
}

impl TransactionHeader {
    /// Advances the decoder past one serialized transaction, collecting
    /// counts. Handles the BIP-141 marker/flag prefix.
    pub fn scan(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let start = decoder.position();
        let version = decoder.read_i32_le()?;

        let mut is_segwit = false;
        let mut input_count = decoder.read_varint()?;
        if input_count == 0 {
            // BIP-141 marker: a zero vin count marks witness serialization
            // and the next byte must be the 0x01 flag.
            let flag = decoder.read_u8()?;
            if flag != 0x01 {
                return Err(DecodeError::InvalidData("invalid segwit flag"));
            }
            is_segwit = true;
            input_count = decoder.read_varint()?;
        }

        for _ in 0..input_count {
            decoder.skip(36)?;
            decoder.skip_var_bytes()?;
            decoder.skip(4)?;
        }

        let output_count = decoder.read_varint()?;
        for _ in 0..output_count {
            decoder.skip(8)?;
            decoder.skip_var_bytes()?;
        }

        if is_segwit {
            for _ in 0..input_count {
                let items = decoder.read_varint()?;
                for _ in 0..items {
                    decoder.skip_var_bytes()?;
                }
            }
        }

        decoder.skip(4)?; // locktime

        let size_bytes = (decoder.position() - start) as u32;
        let input_count =
            u32::try_from(input_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let output_count =
            u32::try_from(output_count).map_err(|_| DecodeError::SizeTooLarge)?;
        Ok(Self {
            version,
            input_count,
            output_count,
            is_segwit,
            size_bytes,
        })
    }
}
