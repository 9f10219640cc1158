//! Configuration
//!
//! Startup configuration: network selector, retry policy, Redis connection, bus
//! subscription and the filter list. Loaded once from a JSON file and immutable after.
//! Anything incomplete is a [`ConfigError`], raised before the bus is consumed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::Level;

use crate::bus::BusConfig;
use crate::network::{Network, NetworkError};
use crate::retry::RetryPolicy;
use crate::script::ScriptError;

/// Config file used when none is given on the command line or in the environment
pub const DEFAULT_CONFIG_PATH: &str = "config/default.json";

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "INDEXER_CONFIG";

/// Default Redis URL for persistence and the bus
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default prefix of every Redis key written by the store
pub const DEFAULT_KEY_PREFIX: &str = "indexer";

/// Errors that make the pipeline configuration unusable
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Filter {filter}: unknown filter kind {kind}")]
    UnknownFilterKind { filter: String, kind: String },

    #[error("Filter {filter}: missing required parameter {param}")]
    MissingFilterParam { filter: String, param: &'static str },

    #[error("Filter {filter}: invalid parameter: {source}")]
    InvalidFilterParam {
        filter: String,
        #[source]
        source: ScriptError,
    },

    #[error("Filter {filter}: unknown processor {processor}")]
    UnknownProcessor { filter: String, processor: String },

    #[error("Invalid retry policy: {0}")]
    InvalidRetry(String),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
}

/// One filter descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,
    /// Filter kind tag: `codeHash`, `spore`, `cluster` or `anyway`
    pub filter: String,
    /// Name of the processor receiving matches
    pub processor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,
    #[serde(rename = "codeHash", default, skip_serializing_if = "Option::is_none")]
    pub code_hash_camel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_type: Option<String>,
    #[serde(rename = "hashType", default, skip_serializing_if = "Option::is_none")]
    pub hash_type_camel: Option<String>,
}

impl FilterConfig {
    pub fn new(name: impl Into<String>, filter: impl Into<String>, processor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: filter.into(),
            processor: processor.into(),
            code_hash: None,
            code_hash_camel: None,
            hash_type: None,
            hash_type_camel: None,
        }
    }

    pub fn with_code_hash(mut self, code_hash: impl Into<String>) -> Self {
        self.code_hash = Some(code_hash.into());
        self
    }

    pub fn code_hash(&self) -> Option<&str> {
        self.code_hash.as_deref().or(self.code_hash_camel.as_deref())
    }

    pub fn hash_type(&self) -> Option<&str> {
        self.hash_type.as_deref().or(self.hash_type_camel.as_deref())
    }
}

/// Redis connection used by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network selector, resolved through [`Network::resolve`]
    pub network: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

impl AppConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the configuration file at `path` (`~` is expanded)
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let expanded = expand_path(path);
        let contents = std::fs::read_to_string(Path::new(&expanded)).map_err(|source| ConfigError::Io {
            path: expanded.clone(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Resolved network
    pub fn network(&self) -> Result<Network, ConfigError> {
        Ok(Network::resolve(&self.network)?)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    /// Check the scalar settings. Filters are checked when the pipeline is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network()?;
        self.log_level()?;
        self.retry.validate().map_err(ConfigError::InvalidRetry)?;
        Ok(())
    }
}

/// Pick the config path: first CLI argument, then the environment, then the default
pub fn resolve_config_path(cli_arg: Option<String>) -> String {
    cli_arg
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
