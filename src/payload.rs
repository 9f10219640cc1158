//! Cell Payload Decoding
//!
//! Decodes the molecule tables stored in spore (asset) and cluster (collection) cell data.
//!
//! A table is laid out as `total_size | offset_0 .. offset_n-1 | field_0 .. field_n-1`
//! with every header word a little-endian u32. `String` and `Bytes` fields are byte
//! vectors prefixed by their u32 length; `BytesOpt` is empty when absent.

use thiserror::Error;

use crate::network::Family;

/// Errors that can occur while decoding a cell payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Payload too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Table total size {header} does not match payload length {actual}")]
    TotalSizeMismatch { header: usize, actual: usize },

    #[error("Invalid field offset {0}")]
    InvalidOffset(usize),

    #[error("Table has {actual} fields, expected at least {expected}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Byte vector in field {field} declares {declared} bytes but holds {actual}")]
    VectorLength {
        field: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("Required field {0} is empty")]
    EmptyField(&'static str),
}

/// Spore cell data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SporeData {
    pub content_type: String,
    pub content: Vec<u8>,
    pub cluster_id: Option<Vec<u8>>,
}

/// Cluster cell data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterData {
    pub name: String,
    pub description: String,
}

fn read_u32(bytes: &[u8], at: usize) -> Result<usize, PayloadError> {
    let word = bytes.get(at..at + 4).ok_or(PayloadError::TooShort {
        expected: at + 4,
        actual: bytes.len(),
    })?;
    Ok(u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as usize)
}

/// Split a molecule table into its raw fields
fn table_fields(bytes: &[u8], expected: usize) -> Result<Vec<&[u8]>, PayloadError> {
    let total = read_u32(bytes, 0)?;
    if total != bytes.len() {
        return Err(PayloadError::TotalSizeMismatch {
            header: total,
            actual: bytes.len(),
        });
    }
    if total == 4 {
        return Err(PayloadError::FieldCount { expected, actual: 0 });
    }

    let first = read_u32(bytes, 4)?;
    if first % 4 != 0 || first < 8 || first > total {
        return Err(PayloadError::InvalidOffset(first));
    }
    let count = first / 4 - 1;
    if count < expected {
        return Err(PayloadError::FieldCount { expected, actual: count });
    }

    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..count {
        offsets.push(read_u32(bytes, 4 + i * 4)?);
    }
    offsets.push(total);

    let mut fields = Vec::with_capacity(count);
    for pair in offsets.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if start > end || end > total {
            return Err(PayloadError::InvalidOffset(start));
        }
        fields.push(&bytes[start..end]);
    }
    Ok(fields)
}

fn read_bytes(field: &'static str, raw: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let declared = read_u32(raw, 0)?;
    let body = &raw[4..];
    if body.len() != declared {
        return Err(PayloadError::VectorLength {
            field,
            declared,
            actual: body.len(),
        });
    }
    Ok(body.to_vec())
}

fn read_string(field: &'static str, raw: &[u8]) -> Result<String, PayloadError> {
    read_bytes(field, raw).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn read_bytes_opt(field: &'static str, raw: &[u8]) -> Result<Option<Vec<u8>>, PayloadError> {
    if raw.is_empty() {
        return Ok(None);
    }
    read_bytes(field, raw).map(Some)
}

/// Build a molecule table from already-serialized fields
fn pack_table(fields: &[Vec<u8>]) -> Vec<u8> {
    let header = 4 * (fields.len() + 1);
    let total = header + fields.iter().map(Vec::len).sum::<usize>();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    let mut offset = header;
    for field in fields {
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += field.len();
    }
    for field in fields {
        out.extend_from_slice(field);
    }
    out
}

fn pack_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

impl SporeData {
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let fields = table_fields(bytes, 3)?;
        Ok(SporeData {
            content_type: read_string("content_type", fields[0])?,
            content: read_bytes("content", fields[1])?,
            cluster_id: read_bytes_opt("cluster_id", fields[2])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        pack_table(&[
            pack_bytes(self.content_type.as_bytes()),
            pack_bytes(&self.content),
            self.cluster_id.as_deref().map(pack_bytes).unwrap_or_default(),
        ])
    }

    /// Content as a 0x-prefixed hex string
    pub fn content_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.content))
    }

    pub fn cluster_id_hex(&self) -> Option<String> {
        self.cluster_id.as_ref().map(|id| format!("0x{}", hex::encode(id)))
    }
}

impl ClusterData {
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let fields = table_fields(bytes, 2)?;
        Ok(ClusterData {
            name: read_string("name", fields[0])?,
            description: read_string("description", fields[1])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        pack_table(&[
            pack_bytes(self.name.as_bytes()),
            pack_bytes(self.description.as_bytes()),
        ])
    }
}

/// Check that `bytes` decodes as `family`'s data with its required fields populated
pub fn validate_family_payload(family: Family, bytes: &[u8]) -> Result<(), PayloadError> {
    match family {
        Family::Asset => {
            let spore = SporeData::decode(bytes)?;
            if spore.content_type.is_empty() {
                return Err(PayloadError::EmptyField("content_type"));
            }
            if spore.content.is_empty() {
                return Err(PayloadError::EmptyField("content"));
            }
        }
        Family::Collection => {
            let cluster = ClusterData::decode(bytes)?;
            if cluster.name.is_empty() {
                return Err(PayloadError::EmptyField("name"));
            }
            if cluster.description.is_empty() {
                return Err(PayloadError::EmptyField("description"));
            }
        }
    }
    Ok(())
}
