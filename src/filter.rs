//! Transaction Filtering
//!
//! Decides which transactions are relevant to which processor. Each configured filter
//! is one of a closed set of predicates: exact code hash match, tracked family match,
//! or match-everything.

use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, FilterConfig};
use crate::network::{Family, Network};
use crate::payload::validate_family_payload;
use crate::script::{HashType, Transaction, H256};

/// Errors raised while evaluating a filter against a transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Transaction has {outputs} outputs but {data} output data entries")]
    OutputsDataMismatch { outputs: usize, data: usize },
}

/// Filter kind tags accepted in configuration
pub const FILTER_KINDS: &[&str] = &["codeHash", "spore", "cluster", "anyway"];

/// The predicate a filter evaluates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    /// Any input or output type script carries this code hash (and hash type, if set)
    CodeHash {
        code_hash: H256,
        hash_type: Option<HashType>,
    },
    /// Any output type script belongs to the family and its payload decodes
    Family { family: Family, network: Network },
    /// Every transaction
    MatchAll,
}

/// A named predicate routing matching transactions to one processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub processor_name: String,
    pub kind: FilterKind,
}

impl Filter {
    pub fn new(name: impl Into<String>, processor_name: impl Into<String>, kind: FilterKind) -> Self {
        Self {
            name: name.into(),
            processor_name: processor_name.into(),
            kind,
        }
    }

    /// Build a filter from its configuration entry
    ///
    /// # Arguments
    /// * `config` - The filter descriptor
    /// * `network` - The resolved network, selecting family code hash tables
    ///
    /// # Returns
    /// The filter, or a `ConfigError` if the kind is unknown or its parameters are missing
    pub fn from_config(config: &FilterConfig, network: Network) -> Result<Self, ConfigError> {
        let kind = match config.filter.as_str() {
            "codeHash" | "code_hash" => {
                let raw = config
                    .code_hash()
                    .ok_or_else(|| ConfigError::MissingFilterParam {
                        filter: config.name.clone(),
                        param: "code_hash",
                    })?;
                let code_hash = H256::from_hex("code_hash", raw).map_err(|source| {
                    ConfigError::InvalidFilterParam {
                        filter: config.name.clone(),
                        source,
                    }
                })?;
                let hash_type = config
                    .hash_type()
                    .map(str::parse::<HashType>)
                    .transpose()
                    .map_err(|source| ConfigError::InvalidFilterParam {
                        filter: config.name.clone(),
                        source,
                    })?;
                FilterKind::CodeHash { code_hash, hash_type }
            }
            "spore" | "asset" => FilterKind::Family {
                family: Family::Asset,
                network,
            },
            "cluster" | "collection" => FilterKind::Family {
                family: Family::Collection,
                network,
            },
            "anyway" | "all" => FilterKind::MatchAll,
            other => {
                return Err(ConfigError::UnknownFilterKind {
                    filter: config.name.clone(),
                    kind: other.to_string(),
                })
            }
        };

        Ok(Filter::new(config.name.clone(), config.processor.clone(), kind))
    }

    /// Evaluate the filter against a transaction
    ///
    /// Cells with malformed type scripts or payloads never match; they are not errors.
    pub fn matches(&self, tx: &Transaction) -> Result<bool, FilterError> {
        match &self.kind {
            FilterKind::CodeHash { code_hash, hash_type } => {
                Ok(matches_code_hash(tx, code_hash, *hash_type))
            }
            FilterKind::Family { family, network } => matches_family(tx, *family, *network),
            FilterKind::MatchAll => Ok(true),
        }
    }
}

fn matches_code_hash(tx: &Transaction, code_hash: &H256, hash_type: Option<HashType>) -> bool {
    tx.inputs.iter().chain(tx.outputs.iter()).any(|cell| match cell.type_script() {
        Ok(Some(script)) => {
            script.code_hash == *code_hash && hash_type.map_or(true, |ht| script.hash_type == ht)
        }
        _ => false,
    })
}

fn matches_family(tx: &Transaction, family: Family, network: Network) -> Result<bool, FilterError> {
    if tx.outputs_data.len() != tx.outputs.len() {
        return Err(FilterError::OutputsDataMismatch {
            outputs: tx.outputs.len(),
            data: tx.outputs_data.len(),
        });
    }

    let matched = tx.outputs.iter().enumerate().any(|(index, output)| {
        let script = match output.type_script() {
            Ok(Some(script)) => script,
            Ok(None) => return false,
            Err(e) => {
                debug!(tx_hash = %tx.hash, index, error = %e, "Output type script is malformed");
                return false;
            }
        };

        if !family.is_member(network, &script.code_hash) {
            return false;
        }

        let valid = tx
            .output_data(index)
            .map_err(|e| e.to_string())
            .and_then(|data| validate_family_payload(family, &data).map_err(|e| e.to_string()));
        match valid {
            Ok(()) => true,
            Err(reason) => {
                debug!(
                    tx_hash = %tx.hash,
                    index,
                    family = family.name(),
                    %reason,
                    "Output payload does not decode as family data"
                );
                false
            }
        }
    });

    Ok(matched)
}
