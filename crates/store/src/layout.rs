//! On-disk record layouts.

use chainscan_primitives::script::AddressType;
use chainscan_primitives::Hash256;

use crate::fixed::FixedRecord;

pub const BLOCK_RECORD_LEN: usize = 68;
pub const TX_RECORD_HEADER_LEN: usize = 17;
pub const INOUT_LEN: usize = 17;

/// Byte offsets of the patchable `Inout` fields.
pub const INOUT_LINKED_TX_NUM_OFFSET: u64 = 0;
pub const INOUT_TO_ADDRESS_NUM_OFFSET: u64 = 4;

/// One fixed-size block record, addressed by height.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRecord {
    pub first_tx_index: u32,
    pub tx_count: u32,
    pub height: u32,
    pub hash: Hash256,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub coinbase_offset: u64,
}

impl FixedRecord for BlockRecord {
    const LEN: usize = BLOCK_RECORD_LEN;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.first_tx_index.to_le_bytes());
        out[4..8].copy_from_slice(&self.tx_count.to_le_bytes());
        out[8..12].copy_from_slice(&self.height.to_le_bytes());
        out[12..44].copy_from_slice(&self.hash);
        out[44..48].copy_from_slice(&self.version.to_le_bytes());
        out[48..52].copy_from_slice(&self.time.to_le_bytes());
        out[52..56].copy_from_slice(&self.bits.to_le_bytes());
        out[56..60].copy_from_slice(&self.nonce.to_le_bytes());
        out[60..68].copy_from_slice(&self.coinbase_offset.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        Some(Self {
            first_tx_index: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            tx_count: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            height: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            hash: bytes[12..44].try_into().ok()?,
            version: i32::from_le_bytes(bytes[44..48].try_into().ok()?),
            time: u32::from_le_bytes(bytes[48..52].try_into().ok()?),
            bits: u32::from_le_bytes(bytes[52..56].try_into().ok()?),
            nonce: u32::from_le_bytes(bytes[56..60].try_into().ok()?),
            coinbase_offset: u64::from_le_bytes(bytes[60..68].try_into().ok()?),
        })
    }
}

impl FixedRecord for Hash256 {
    const LEN: usize = 32;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok()
    }
}

/// Fixed prefix of a transaction record in the tx file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxRecordHeader {
    pub size_bytes: u32,
    pub locktime: u32,
    pub version: i32,
    pub input_count: u16,
    pub output_count: u16,
    pub is_segwit: bool,
}

impl TxRecordHeader {
    pub fn encode(&self, out: &mut [u8; TX_RECORD_HEADER_LEN]) {
        out[0..4].copy_from_slice(&self.size_bytes.to_le_bytes());
        out[4..8].copy_from_slice(&self.locktime.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..14].copy_from_slice(&self.input_count.to_le_bytes());
        out[14..16].copy_from_slice(&self.output_count.to_le_bytes());
        out[16] = if self.is_segwit { 1 } else { 0 };
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_RECORD_HEADER_LEN {
            return None;
        }
        Some(Self {
            size_bytes: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            locktime: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            version: i32::from_le_bytes(bytes[8..12].try_into().ok()?),
            input_count: u16::from_le_bytes(bytes[12..14].try_into().ok()?),
            output_count: u16::from_le_bytes(bytes[14..16].try_into().ok()?),
            is_segwit: bytes[16] != 0,
        })
    }
}

/// One input or output slot of a transaction record.
///
/// For an input, `linked_tx_num` points at the producing transaction.
/// For an output, it is patched to the spending transaction once the
/// spend is processed (0 while unspent). `to_address_num` is 0 until
/// the address stage resolves it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Inout {
    pub linked_tx_num: u32,
    pub to_address_num: u32,
    pub address_type: AddressType,
    pub value: u64,
}

impl Inout {
    pub fn encode(&self, out: &mut [u8; INOUT_LEN]) {
        out[0..4].copy_from_slice(&self.linked_tx_num.to_le_bytes());
        out[4..8].copy_from_slice(&self.to_address_num.to_le_bytes());
        out[8] = self.address_type as u8;
        out[9..17].copy_from_slice(&self.value.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != INOUT_LEN {
            return None;
        }
        Some(Self {
            linked_tx_num: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            to_address_num: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            address_type: AddressType::from_u8(bytes[8])?,
            value: u64::from_le_bytes(bytes[9..17].try_into().ok()?),
        })
    }
}
