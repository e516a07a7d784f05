//! Output script classification.
//!
//! Every output script decodes into exactly one `ScriptOutput` variant;
//! scripts that match no known template land in `Nonstandard` and stay
//! spendable. Provably unspendable `OP_RETURN` data carriers are the only
//! type excluded from the UTXO set.

const OP_0: u8 = 0x00;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

/// Witness commitment marker inside a coinbase `OP_RETURN` push.
pub const SEGWIT_COMMITMENT_MAGIC: [u8; 4] = [0xaa, 0x21, 0xa9, 0xed];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum AddressType {
    Nonstandard = 0,
    Pubkey = 1,
    PubkeyHash = 2,
    ScriptHash = 3,
    Multisig = 4,
    NullData = 5,
    WitnessPubkeyHash = 6,
    WitnessScriptHash = 7,
}

impl AddressType {
    pub const ALL: [AddressType; 8] = [
        AddressType::Nonstandard,
        AddressType::Pubkey,
        AddressType::PubkeyHash,
        AddressType::ScriptHash,
        AddressType::Multisig,
        AddressType::NullData,
        AddressType::WitnessPubkeyHash,
        AddressType::WitnessScriptHash,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Nonstandard),
            1 => Some(Self::Pubkey),
            2 => Some(Self::PubkeyHash),
            3 => Some(Self::ScriptHash),
            4 => Some(Self::Multisig),
            5 => Some(Self::NullData),
            6 => Some(Self::WitnessPubkeyHash),
            7 => Some(Self::WitnessScriptHash),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nonstandard => "nonstandard",
            Self::Pubkey => "pubkey",
            Self::PubkeyHash => "pubkeyhash",
            Self::ScriptHash => "scripthash",
            Self::Multisig => "multisig",
            Self::NullData => "nulldata",
            Self::WitnessPubkeyHash => "witness_pubkeyhash",
            Self::WitnessScriptHash => "witness_scripthash",
        }
    }

    /// Outputs of every type except `OP_RETURN` data carriers enter the
    /// UTXO set.
    pub fn is_spendable(self) -> bool {
        !matches!(self, Self::NullData)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptOutput {
    Pubkey { pubkey: Vec<u8> },
    PubkeyHash { hash: [u8; 20] },
    ScriptHash { hash: [u8; 20] },
    Multisig { script: Vec<u8> },
    NullData { script: Vec<u8> },
    WitnessPubkeyHash { hash: [u8; 20] },
    WitnessScriptHash { hash: [u8; 32] },
    Nonstandard { script: Vec<u8> },
}

impl ScriptOutput {
    pub fn from_script(script: &[u8]) -> Self {
        if let Some(hash) = match_p2pkh(script) {
            Self::PubkeyHash { hash }
        } else if let Some(hash) = match_p2sh(script) {
            Self::ScriptHash { hash }
        } else if let Some(hash) = match_p2wpkh(script) {
            Self::WitnessPubkeyHash { hash }
        } else if let Some(hash) = match_p2wsh(script) {
            Self::WitnessScriptHash { hash }
        } else if let Some(pubkey) = match_p2pk(script) {
            Self::Pubkey {
                pubkey: pubkey.to_vec(),
            }
        } else if !script.is_empty() && script[0] == OP_RETURN {
            Self::NullData {
                script: script.to_vec(),
            }
        } else if is_multisig(script) {
            Self::Multisig {
                script: script.to_vec(),
            }
        } else {
            Self::Nonstandard {
                script: script.to_vec(),
            }
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Self::Pubkey { .. } => AddressType::Pubkey,
            Self::PubkeyHash { .. } => AddressType::PubkeyHash,
            Self::ScriptHash { .. } => AddressType::ScriptHash,
            Self::Multisig { .. } => AddressType::Multisig,
            Self::NullData { .. } => AddressType::NullData,
            Self::WitnessPubkeyHash { .. } => AddressType::WitnessPubkeyHash,
            Self::WitnessScriptHash { .. } => AddressType::WitnessScriptHash,
            Self::Nonstandard { .. } => AddressType::Nonstandard,
        }
    }

    pub fn is_spendable(&self) -> bool {
        self.address_type().is_spendable()
    }

    /// Registry key: the decoded payload for template types, the raw
    /// script otherwise. Unique per address within a type partition.
    pub fn fingerprint(&self) -> &[u8] {
        match self {
            Self::Pubkey { pubkey } => pubkey,
            Self::PubkeyHash { hash } => hash,
            Self::ScriptHash { hash } => hash,
            Self::Multisig { script } => script,
            Self::NullData { script } => script,
            Self::WitnessPubkeyHash { hash } => hash,
            Self::WitnessScriptHash { hash } => hash,
            Self::Nonstandard { script } => script,
        }
    }

    /// Reconstructs the canonical scriptPubKey.
    pub fn script_bytes(&self) -> Vec<u8> {
        match self {
            Self::Pubkey { pubkey } => {
                let mut script = Vec::with_capacity(pubkey.len() + 2);
                script.push(pubkey.len() as u8);
                script.extend_from_slice(pubkey);
                script.push(OP_CHECKSIG);
                script
            }
            Self::PubkeyHash { hash } => {
                let mut script = Vec::with_capacity(25);
                script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
                script.extend_from_slice(hash);
                script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
                script
            }
            Self::ScriptHash { hash } => {
                let mut script = Vec::with_capacity(23);
                script.extend_from_slice(&[OP_HASH160, 0x14]);
                script.extend_from_slice(hash);
                script.push(OP_EQUAL);
                script
            }
            Self::WitnessPubkeyHash { hash } => {
                let mut script = Vec::with_capacity(22);
                script.extend_from_slice(&[OP_0, 0x14]);
                script.extend_from_slice(hash);
                script
            }
            Self::WitnessScriptHash { hash } => {
                let mut script = Vec::with_capacity(34);
                script.extend_from_slice(&[OP_0, 0x20]);
                script.extend_from_slice(hash);
                script
            }
            Self::Multisig { script }
            | Self::NullData { script }
            | Self::Nonstandard { script } => script.clone(),
        }
    }

    /// BIP-141 witness commitment check for coinbase `OP_RETURN` outputs:
    /// a pushed payload beginning `AA 21 A9 ED` followed by a 32-byte
    /// commitment.
    pub fn is_segwit_commitment(&self) -> bool {
        let Self::NullData { script } = self else {
            return false;
        };
        let Some(payload) = null_data_payload(script) else {
            return false;
        };
        payload.len() >= 36 && payload[0..4] == SEGWIT_COMMITMENT_MAGIC
    }
}

fn null_data_payload(script: &[u8]) -> Option<&[u8]> {
    if script.first() != Some(&OP_RETURN) {
        return None;
    }
    let push_len = *script.get(1)? as usize;
    if push_len == 0 || push_len > 0x4b {
        return None;
    }
    script.get(2..2 + push_len)
}

fn match_p2pkh(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        script[3..23].try_into().ok()
    } else {
        None
    }
}

fn match_p2sh(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
    {
        script[2..22].try_into().ok()
    } else {
        None
    }
}

fn match_p2wpkh(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 22 && script[0] == OP_0 && script[1] == 0x14 {
        script[2..].try_into().ok()
    } else {
        None
    }
}

fn match_p2wsh(script: &[u8]) -> Option<[u8; 32]> {
    if script.len() == 34 && script[0] == OP_0 && script[1] == 0x20 {
        script[2..].try_into().ok()
    } else {
        None
    }
}

fn match_p2pk(script: &[u8]) -> Option<&[u8]> {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len as usize,
        Some(len @ 65) => len as usize,
        _ => return None,
    };
    if script.len() == key_len + 2 && script[script.len() - 1] == OP_CHECKSIG {
        Some(&script[1..1 + key_len])
    } else {
        None
    }
}

fn is_multisig(script: &[u8]) -> bool {
    if script.len() < 3 {
        return false;
    }
    let required = script[0];
    let total = script[script.len() - 2];
    if script[script.len() - 1] != OP_CHECKMULTISIG
        || !(OP_1..=OP_16).contains(&required)
        || !(OP_1..=OP_16).contains(&total)
        || required > total
    {
        return false;
    }
    // Every element between m and n must be a 33- or 65-byte key push.
    let mut cursor = 1;
    let end = script.len() - 2;
    let mut keys = 0usize;
    while cursor < end {
        let push = script[cursor] as usize;
        if push != 33 && push != 65 {
            return false;
        }
        cursor += 1 + push;
        keys += 1;
    }
    cursor == end && keys == (total - OP_1 + 1) as usize
}
