//! Address and Script Hash Codec
//!
//! Maps a normalized [`Script`] to its bech32 address and to its canonical script hash.
//! Only the full payload (version 0x02) is produced; the short payload (version 0x01)
//! is still accepted when decoding externally produced addresses.

use bech32::{FromBase32, ToBase32, Variant};
use std::sync::Arc;
use thiserror::Error;

use crate::network::{short_form_code_hash, Network};
use crate::script::{HashType, Script, H256};

/// Payload version of the index-based short address
pub const SHORT_PAYLOAD_VERSION: u8 = 0x01;

/// Payload version of the full address carrying code hash, hash type and args
pub const FULL_PAYLOAD_VERSION: u8 = 0x02;

/// Longest address string accepted or produced
pub const ADDRESS_MAX_LENGTH: usize = 250;

/// Personalization of the blake2b hash used for script hashes
pub const CKB_HASH_PERSONALIZATION: &[u8] = b"ckb-default-hash";

/// Errors that can occur while encoding or decoding an address
#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Bech32 error: {0}")]
    Bech32(#[from] bech32::Error),

    #[error("Address length {0} exceeds limit of 250")]
    TooLong(usize),

    #[error("Invalid address prefix: {0}")]
    UnknownPrefix(String),

    #[error("Address uses the bech32m checksum, expected bech32")]
    UnsupportedVariant,

    #[error("Empty address payload")]
    EmptyPayload,

    #[error("Unsupported address version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("Invalid payload length {len} for address version {version:#04x}")]
    InvalidPayloadLength { version: u8, len: usize },

    #[error("Unknown hash type code: {0:#04x}")]
    UnknownHashTypeCode(u8),

    #[error("Unknown code hash index: {0:#04x}")]
    UnknownCodeHashIndex(u8),
}

/// Hash primitive used to derive script hashes
pub trait ScriptHasher: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> H256;
}

/// blake2b-256 with the `ckb-default-hash` personalization
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake2bHasher;

impl ScriptHasher for Blake2bHasher {
    fn hash(&self, bytes: &[u8]) -> H256 {
        let digest = blake2b_simd::Params::new()
            .hash_length(32)
            .personal(CKB_HASH_PERSONALIZATION)
            .hash(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_bytes());
        H256(out)
    }
}

/// Canonical molecule serialization of a script.
///
/// Layout: total size, three field offsets (all u32 LE), the 32-byte code hash,
/// the hash type byte, then args as a u32 LE length followed by the bytes.
pub fn serialize_script(script: &Script) -> Vec<u8> {
    const HEADER_SIZE: u32 = 4 * 4;
    let code_hash_offset = HEADER_SIZE;
    let hash_type_offset = code_hash_offset + 32;
    let args_offset = hash_type_offset + 1;
    let total_size = args_offset + 4 + script.args.len() as u32;

    let mut out = Vec::with_capacity(total_size as usize);
    out.extend_from_slice(&total_size.to_le_bytes());
    out.extend_from_slice(&code_hash_offset.to_le_bytes());
    out.extend_from_slice(&hash_type_offset.to_le_bytes());
    out.extend_from_slice(&args_offset.to_le_bytes());
    out.extend_from_slice(script.code_hash.as_bytes());
    out.push(script.hash_type.molecule_byte());
    out.extend_from_slice(&(script.args.len() as u32).to_le_bytes());
    out.extend_from_slice(&script.args);
    out
}

/// Script hash of `script` under `hasher`
pub fn script_hash(script: &Script, hasher: &dyn ScriptHasher) -> H256 {
    hasher.hash(&serialize_script(script))
}

/// Encode `script` as a full-payload address for `network`
pub fn to_address(script: &Script, network: Network) -> Result<String, AddressError> {
    let mut payload = Vec::with_capacity(34 + script.args.len());
    payload.push(FULL_PAYLOAD_VERSION);
    payload.extend_from_slice(script.code_hash.as_bytes());
    payload.push(script.hash_type.code());
    payload.extend_from_slice(&script.args);

    let address = bech32::encode(network.hrp(), payload.to_base32(), Variant::Bech32)?;
    if address.len() > ADDRESS_MAX_LENGTH {
        return Err(AddressError::TooLong(address.len()));
    }
    Ok(address)
}

/// Decode an address back into its script and network
pub fn from_address(address: &str) -> Result<(Script, Network), AddressError> {
    if address.len() > ADDRESS_MAX_LENGTH {
        return Err(AddressError::TooLong(address.len()));
    }

    let (hrp, words, variant) = bech32::decode(address)?;
    let network = Network::from_hrp(&hrp).ok_or(AddressError::UnknownPrefix(hrp))?;
    if variant != Variant::Bech32 {
        return Err(AddressError::UnsupportedVariant);
    }

    let payload = Vec::<u8>::from_base32(&words)?;
    let (&version, body) = payload.split_first().ok_or(AddressError::EmptyPayload)?;

    let script = match version {
        SHORT_PAYLOAD_VERSION => parse_short_payload(body)?,
        FULL_PAYLOAD_VERSION => parse_full_payload(body)?,
        other => return Err(AddressError::UnsupportedVersion(other)),
    };

    Ok((script, network))
}

fn parse_short_payload(body: &[u8]) -> Result<Script, AddressError> {
    let (&index, args) = body.split_first().ok_or(AddressError::InvalidPayloadLength {
        version: SHORT_PAYLOAD_VERSION,
        len: body.len() + 1,
    })?;
    let code_hash = short_form_code_hash(index).ok_or(AddressError::UnknownCodeHashIndex(index))?;
    Ok(Script::new(code_hash, HashType::Type, args.to_vec()))
}

fn parse_full_payload(body: &[u8]) -> Result<Script, AddressError> {
    if body.len() < 33 {
        return Err(AddressError::InvalidPayloadLength {
            version: FULL_PAYLOAD_VERSION,
            len: body.len() + 1,
        });
    }

    let mut code_hash = [0u8; 32];
    code_hash.copy_from_slice(&body[..32]);
    let hash_type = HashType::from_code(body[32]).ok_or(AddressError::UnknownHashTypeCode(body[32]))?;

    Ok(Script::new(H256(code_hash), hash_type, body[33..].to_vec()))
}

/// Network-bound codec handed to processors at construction
#[derive(Clone)]
pub struct AddressCodec {
    network: Network,
    hasher: Arc<dyn ScriptHasher>,
}

impl AddressCodec {
    pub fn new(network: Network, hasher: Arc<dyn ScriptHasher>) -> Self {
        Self { network, hasher }
    }

    /// Codec using the default blake2b hasher
    pub fn with_default_hasher(network: Network) -> Self {
        Self::new(network, Arc::new(Blake2bHasher))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn address(&self, script: &Script) -> Result<String, AddressError> {
        to_address(script, self.network)
    }

    pub fn script_hash(&self, script: &Script) -> H256 {
        script_hash(script, self.hasher.as_ref())
    }
}

impl std::fmt::Debug for AddressCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressCodec").field("network", &self.network).finish()
    }
}
