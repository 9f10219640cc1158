//! CKB Event Indexer Library
//!
//! This crate consumes raw CKB transactions from a Redis bus, routes each one through
//! configured filters to processors, derives asset, collection, value movement and DAO
//! events from input/output diffs, and persists them idempotently.

pub mod address;
pub mod bus;
pub mod config;
pub mod derive;
pub mod events;
pub mod filter;
pub mod network;
pub mod payload;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod script;
pub mod store;

// Re-export commonly used types
pub use address::{from_address, script_hash, to_address, AddressCodec};
pub use config::AppConfig;
pub use filter::{Filter, FilterKind};
pub use network::{Family, Network};
pub use pipeline::{ErrorReporter, Pipeline, Settlement, TracingReporter};
pub use processor::{build_processor, Processor};
pub use queue::{IngestionQueue, QueueHandle};
pub use script::{normalize, RawScript, Script, Transaction};
pub use store::{MemoryStore, RedisStore, Store};
