//! Script Model
//!
//! Canonical script representation and the wire transaction model delivered by the bus.
//! Scripts arrive in either snake_case (`code_hash`, `hash_type`) or camelCase
//! (`codeHash`, `hashType`) spelling and are normalized into [`Script`] on demand.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while normalizing a raw script
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Invalid script: missing fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("Invalid hex in field {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    #[error("Invalid code hash length: expected 32 bytes, got {0}")]
    InvalidDigestLength(usize),

    #[error("Unsupported hash type: {0}")]
    UnknownHashType(String),

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),
}

/// A 32-byte digest (code hash or script hash)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct H256(pub [u8; 32]);

impl H256 {
    /// Parse a compile-time hex constant (64 hex chars, optional 0x prefix).
    ///
    /// Panics during const evaluation on malformed input.
    pub const fn from_hex_const(s: &str) -> Self {
        let bytes = s.as_bytes();
        let offset = if bytes.len() >= 2 && bytes[0] == b'0' && bytes[1] == b'x' { 2 } else { 0 };
        assert!(bytes.len() - offset == 64, "digest constant must be 64 hex chars");

        let mut out = [0u8; 32];
        let mut i = 0;
        while i < 32 {
            let hi = hex_nibble(bytes[offset + i * 2]);
            let lo = hex_nibble(bytes[offset + i * 2 + 1]);
            out[i] = (hi << 4) | lo;
            i += 1;
        }
        H256(out)
    }

    /// Parse a runtime hex string into a digest
    pub fn from_hex(field: &'static str, s: &str) -> Result<Self, ScriptError> {
        let bytes = hex_to_bytes(field, s)?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ScriptError::InvalidDigestLength(bytes.len()))?;
        Ok(H256(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

const fn hex_nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex digit in digest constant"),
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H256({})", self)
    }
}

/// How a script's code hash is resolved on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    Type,
    Data,
    Data1,
    Data2,
}

impl HashType {
    /// Single-byte code used by the address payload and the script serialization
    pub fn code(&self) -> u8 {
        match self {
            HashType::Type => 0x00,
            HashType::Data => 0x01,
            HashType::Data1 => 0x02,
            HashType::Data2 => 0x03,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(HashType::Type),
            0x01 => Some(HashType::Data),
            0x02 => Some(HashType::Data1),
            0x03 => Some(HashType::Data2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashType::Type => "type",
            HashType::Data => "data",
            HashType::Data1 => "data1",
            HashType::Data2 => "data2",
        }
    }

    /// The molecule serialization of a script uses a different byte than the address
    /// payload: `data` is 0, `type` is 1, `data1` is 2, `data2` is 4.
    pub fn molecule_byte(&self) -> u8 {
        match self {
            HashType::Data => 0x00,
            HashType::Type => 0x01,
            HashType::Data1 => 0x02,
            HashType::Data2 => 0x04,
        }
    }
}

impl FromStr for HashType {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "type" => Ok(HashType::Type),
            "data" => Ok(HashType::Data),
            "data1" => Ok(HashType::Data1),
            "data2" => Ok(HashType::Data2),
            _ => Err(ScriptError::UnknownHashType(s.to_string())),
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical script: code hash, hash type and args
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Script {
    pub code_hash: H256,
    pub hash_type: HashType,
    pub args: Vec<u8>,
}

impl Script {
    pub fn new(code_hash: H256, hash_type: HashType, args: Vec<u8>) -> Self {
        Self {
            code_hash,
            hash_type,
            args,
        }
    }

    /// Args as a 0x-prefixed hex string. For tracked type scripts this is the identifier.
    pub fn args_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.args))
    }

    /// Render back to the snake_case wire spelling
    pub fn to_raw(&self) -> RawScript {
        RawScript {
            code_hash: Some(self.code_hash.to_string()),
            hash_type: Some(self.hash_type.as_str().to_string()),
            args: Some(self.args_hex()),
            ..Default::default()
        }
    }
}

/// Script as delivered on the wire, in either field spelling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawScript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,
    #[serde(rename = "codeHash", default, skip_serializing_if = "Option::is_none")]
    pub code_hash_camel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_type: Option<String>,
    #[serde(rename = "hashType", default, skip_serializing_if = "Option::is_none")]
    pub hash_type_camel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

impl RawScript {
    /// Same script using the camelCase field spelling
    pub fn to_camel_case(&self) -> RawScript {
        RawScript {
            code_hash: None,
            code_hash_camel: self.code_hash.clone().or_else(|| self.code_hash_camel.clone()),
            hash_type: None,
            hash_type_camel: self.hash_type.clone().or_else(|| self.hash_type_camel.clone()),
            args: self.args.clone(),
        }
    }
}

/// Normalize a raw script into its canonical form.
///
/// Every absent field is reported at once. Empty strings count as absent, the hash
/// type is lower-cased before parsing.
pub fn normalize(raw: &RawScript) -> Result<Script, ScriptError> {
    let pick = |snake: &Option<String>, camel: &Option<String>| {
        snake
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| camel.as_deref().filter(|s| !s.is_empty()))
            .map(str::to_string)
    };

    let code_hash = pick(&raw.code_hash, &raw.code_hash_camel);
    let hash_type = pick(&raw.hash_type, &raw.hash_type_camel);
    let args = raw.args.as_deref().filter(|s| !s.is_empty());

    let mut missing = Vec::new();
    if code_hash.is_none() {
        missing.push("code_hash");
    }
    if hash_type.is_none() {
        missing.push("hash_type");
    }
    if args.is_none() {
        missing.push("args");
    }

    match (code_hash, hash_type, args) {
        (Some(code_hash), Some(hash_type), Some(args)) => Ok(Script {
            code_hash: H256::from_hex("code_hash", &code_hash)?,
            hash_type: hash_type.to_lowercase().parse()?,
            args: hex_to_bytes("args", args)?,
        }),
        _ => Err(ScriptError::MissingFields(missing)),
    }
}

/// Parse a hex string to bytes (with or without 0x prefix)
pub fn hex_to_bytes(field: &'static str, hex_str: &str) -> Result<Vec<u8>, ScriptError> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| ScriptError::InvalidHex {
        field,
        reason: e.to_string(),
    })
}

/// Parse a capacity given as a decimal string or 0x-prefixed hex
pub fn parse_capacity(capacity: &str) -> Result<u64, ScriptError> {
    let parsed = match capacity.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => capacity.parse::<u64>(),
    };
    parsed.map_err(|_| ScriptError::InvalidCapacity(capacity.to_string()))
}

/// Reference to the output a cell was created by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPoint {
    #[serde(alias = "txHash")]
    pub tx_hash: String,
    pub index: String,
}

/// A cell in a transaction's inputs or outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub capacity: String,
    pub lock: RawScript,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_script: Option<RawScript>,
    /// Payload the cell carried when it was created. Only inputs resolved by the bus carry it.
    #[serde(default, alias = "outputData", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, alias = "previousOutput", skip_serializing_if = "Option::is_none")]
    pub previous_output: Option<OutPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

impl Cell {
    /// Normalized type script, `Ok(None)` when the cell has none
    pub fn type_script(&self) -> Result<Option<Script>, ScriptError> {
        self.type_script.as_ref().map(normalize).transpose()
    }

    pub fn lock_script(&self) -> Result<Script, ScriptError> {
        normalize(&self.lock)
    }
}

/// Raw transaction as delivered by the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, alias = "cellDeps")]
    pub cell_deps: Vec<serde_json::Value>,
    #[serde(default, alias = "headerDeps")]
    pub header_deps: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<Cell>,
    #[serde(default)]
    pub outputs: Vec<Cell>,
    #[serde(default, alias = "outputsData")]
    pub outputs_data: Vec<String>,
    #[serde(default)]
    pub witnesses: Vec<String>,
}

impl Transaction {
    /// Output payload bytes at `index`; missing entries decode as empty
    pub fn output_data(&self, index: usize) -> Result<Vec<u8>, ScriptError> {
        match self.outputs_data.get(index) {
            Some(data) => hex_to_bytes("outputs_data", data),
            None => Ok(Vec::new()),
        }
    }

    /// Payload for the input at `index`: the cell's own data when the bus resolved it,
    /// otherwise the output payload at the same position.
    pub fn input_data(&self, index: usize) -> Result<Vec<u8>, ScriptError> {
        match self.inputs.get(index).and_then(|cell| cell.data.as_deref()) {
            Some(data) => hex_to_bytes("data", data),
            None => self.output_data(index),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
