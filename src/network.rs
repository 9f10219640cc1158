//! Networks and Well-Known Scripts
//!
//! Network selection plus the static digest tables every other module consults:
//! tracked family code hashes per network, the DAO type script and the closed
//! short-address table.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::script::H256;

pub const MAINNET_ALIASES: &[&str] = &["main", "mainnet", "mirana"];
pub const TESTNET_ALIASES: &[&str] = &["test", "testnet", "pudge", "meepo"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Invalid network type: {0}. Must be one of: main, mainnet, mirana, test, testnet, pudge, meepo")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Resolve a configured network selector, accepting the known aliases
    pub fn resolve(selector: &str) -> Result<Self, NetworkError> {
        let normalized = selector.trim().to_lowercase();
        if MAINNET_ALIASES.contains(&normalized.as_str()) {
            Ok(Network::Mainnet)
        } else if TESTNET_ALIASES.contains(&normalized.as_str()) {
            Ok(Network::Testnet)
        } else {
            Err(NetworkError::Unknown(selector.to_string()))
        }
    }

    /// Human-readable address prefix
    pub fn hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "ckb",
            Network::Testnet => "ckt",
        }
    }

    pub fn from_hrp(hrp: &str) -> Option<Self> {
        match hrp {
            "ckb" => Some(Network::Mainnet),
            "ckt" => Some(Network::Testnet),
            _ => None,
        }
    }
}

impl FromStr for Network {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::resolve(s)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

/// Families of identity-bearing cells tracked by the derivation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Spore cells: mint, transfer, melt
    Asset,
    /// Cluster cells: create, transfer
    Collection,
}

impl Family {
    pub fn name(&self) -> &'static str {
        match self {
            Family::Asset => "spore",
            Family::Collection => "cluster",
        }
    }

    /// Known type script code hashes of this family on `network`
    pub fn code_hashes(&self, network: Network) -> &'static [H256] {
        match (self, network) {
            (Family::Asset, Network::Mainnet) => &[SPORE_MAINNET],
            (Family::Asset, Network::Testnet) => &SPORE_TESTNET,
            (Family::Collection, Network::Mainnet) => &[CLUSTER_MAINNET],
            (Family::Collection, Network::Testnet) => &CLUSTER_TESTNET,
        }
    }

    pub fn is_member(&self, network: Network, code_hash: &H256) -> bool {
        self.code_hashes(network).contains(code_hash)
    }
}

pub const SPORE_MAINNET: H256 =
    H256::from_hex_const("0x4a4dce1df3dffff7f8b2cd7dff7303df3b6150c9788cb75dcf6747247132b9f5");
pub const SPORE_TESTNET: [H256; 3] = [
    H256::from_hex_const("0x685a60219309029d01310311dba953d67029170ca4848a4ff638e57002130a0d"),
    H256::from_hex_const("0x5e063b4c0e7abeaa6a428df3b693521a3050934cf3b0ae97a800d1bc31449398"),
    H256::from_hex_const("0xbbad126377d45f90a8ee120da988a2d7332c78ba8fd679aab478a19d6c133494"),
];

pub const CLUSTER_MAINNET: H256 =
    H256::from_hex_const("0x7366a61534fa7c7e6225ecc0d828ea3b5366adec2b58206f2ee84995fe030075");
pub const CLUSTER_TESTNET: [H256; 3] = [
    H256::from_hex_const("0x598d793defef36e2eeba54a9b45130e4ca92822e1d193671f490950c3b856080"),
    H256::from_hex_const("0x7366a61534fa7c7e6225ecc0d828ea3b5366adec2b58206f2ee84995fe030075"),
    H256::from_hex_const("0x0bbe768b519d8ea7b96d58f1182eb7e6ef96c541fbd9526975077ee09f049058"),
];

/// Nervos DAO type script code hash (same on both networks)
pub const DAO_CODE_HASH: H256 =
    H256::from_hex_const("0x82d76d1b75fe2fd9a27dfbaa65a039221a380d76c926f378d3f81cf3e7e13f2e");

/// Short address code hash indexes. Decode only, never produced.
pub const SHORT_FORM_SCRIPTS: &[(u8, H256)] = &[
    // secp256k1/blake160
    (
        0x00,
        H256::from_hex_const("0x9bd7e06f3ecf4be0f2fcd2188b23f1b9fcc88e5d4b65a8637b17723bbda3cce8"),
    ),
    // secp256k1/multisig
    (
        0x01,
        H256::from_hex_const("0x5c5069eb0857efc65e1bca0c07df34c31663b3622fd3876c876320fc9634e2a8"),
    ),
    // anyone-can-pay
    (
        0x02,
        H256::from_hex_const("0xd369597ff47f29fbc0d47d2e3775370d1250b85140c670e4718af712983a2354"),
    ),
];

pub fn short_form_code_hash(index: u8) -> Option<H256> {
    SHORT_FORM_SCRIPTS
        .iter()
        .find(|(i, _)| *i == index)
        .map(|(_, code_hash)| *code_hash)
}
