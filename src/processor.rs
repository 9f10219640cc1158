//! Processors
//!
//! A processor turns one matched transaction into persisted documents. Every processor
//! here is an [`EventProcessor`] wrapping a family-specific [`Derive`] step; the template
//! owns persistence and logging so the derive steps stay pure transformations.
//!
//! Processors are looked up by name when the pipeline is built:
//!
//! | Name | Aliases | Collection |
//! |------|---------|------------|
//! | `spore` | `asset` | `spore_events` |
//! | `cluster` | `collection` | `cluster_events` |
//! | `anyway` | `generic` | `transactions` |
//! | `dao` | | `dao_transactions` |

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::address::{AddressCodec, AddressError};
use crate::derive::{diff_cells, CellChange};
use crate::events::{
    current_timestamp_millis, AssetEvent, AssetOperation, CollectionEvent, CollectionOperation,
    DaoOperation, DaoRecord, MovementRecord, MovementStatus, Party, CLUSTER_EVENTS, DAO_TRANSACTIONS,
    SPORE_EVENTS, TRANSACTIONS,
};
use crate::network::DAO_CODE_HASH;
use crate::payload::{ClusterData, SporeData};
use crate::script::{parse_capacity, Cell, ScriptError, Transaction};
use crate::store::{Record, Store, StoreError};

/// Processor names accepted in configuration
pub const PROCESSOR_NAMES: &[&str] = &["spore", "cluster", "anyway", "dao"];

/// Errors that fail one processor invocation
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid script: {0}")]
    Script(#[from] ScriptError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Event for {identifier} could not be serialized: {source}")]
    Event {
        identifier: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProcessorError {
    /// Identifier of the tracked cell the failure belongs to, if any
    pub fn identifier(&self) -> Option<&str> {
        match self {
            ProcessorError::Event { identifier, .. } => Some(identifier),
            _ => None,
        }
    }
}

fn event_value<E: serde::Serialize>(identifier: &str, event: &E) -> Result<Value, ProcessorError> {
    serde_json::to_value(event).map_err(|source| ProcessorError::Event {
        identifier: identifier.to_string(),
        source,
    })
}

/// A named consumer of matched transactions
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Process one transaction, returning the first persisted document if any
    async fn process(&self, tx: &Transaction) -> Result<Option<Value>, ProcessorError>;
}

/// Family-specific step of an [`EventProcessor`]
#[async_trait]
pub trait Derive: Send + Sync {
    fn name(&self) -> &'static str;

    /// Collection the derived records are written to
    fn collection(&self) -> &'static str;

    /// Derive the records to persist. The store is available for read-modify-write steps.
    async fn derive(&self, tx: &Transaction, store: &dyn Store) -> Result<Vec<Record>, ProcessorError>;
}

/// Derive, persist in one batch, log
pub struct EventProcessor<D> {
    deriver: D,
    store: Arc<dyn Store>,
}

impl<D: Derive> EventProcessor<D> {
    pub fn new(deriver: D, store: Arc<dyn Store>) -> Self {
        Self { deriver, store }
    }
}

#[async_trait]
impl<D: Derive> Processor for EventProcessor<D> {
    fn name(&self) -> &str {
        self.deriver.name()
    }

    async fn process(&self, tx: &Transaction) -> Result<Option<Value>, ProcessorError> {
        let records = self.deriver.derive(tx, self.store.as_ref()).await?;
        if records.is_empty() {
            debug!(processor = self.name(), tx_hash = %tx.hash, "No events derived");
            return Ok(None);
        }

        let count = records.len();
        let saved = self
            .store
            .upsert_batch(self.deriver.collection(), records)
            .await?;
        info!(
            processor = self.name(),
            tx_hash = %tx.hash,
            collection = self.deriver.collection(),
            count,
            "Persisted derived events"
        );

        Ok(saved.into_iter().next())
    }
}

/// Key of a per-identifier event: one document per (transaction, identifier)
pub fn event_key(tx_hash: &str, identifier: &str) -> String {
    format!("{tx_hash}:{identifier}")
}

// ==================== asset family ====================

/// Mint, transfer and melt events for spore cells
pub struct SporeDeriver {
    codec: Arc<AddressCodec>,
}

impl SporeDeriver {
    pub fn new(codec: Arc<AddressCodec>) -> Self {
        Self { codec }
    }
}

fn asset_event(tx_hash: &str, change: CellChange<SporeData>) -> AssetEvent {
    let (operation, spore_id, from, to, data) = match change {
        CellChange::Created { identifier, to, data } => (AssetOperation::Mint, identifier, None, Some(to), Some(data)),
        CellChange::Transferred {
            identifier,
            from,
            to,
            data,
        } => (AssetOperation::Transfer, identifier, Some(from), Some(to), Some(data)),
        CellChange::Destroyed { identifier, from, data } => {
            (AssetOperation::Melt, identifier, Some(from), None, data)
        }
    };

    AssetEvent {
        tx_hash: tx_hash.to_string(),
        operation,
        spore_id,
        from_address: from,
        to_address: to,
        content_type: data.as_ref().map(|d| d.content_type.clone()).unwrap_or_default(),
        content: data.as_ref().map(SporeData::content_hex).unwrap_or_default(),
        cluster_id: data.as_ref().and_then(SporeData::cluster_id_hex),
    }
}

#[async_trait]
impl Derive for SporeDeriver {
    fn name(&self) -> &'static str {
        "spore"
    }

    fn collection(&self) -> &'static str {
        SPORE_EVENTS
    }

    async fn derive(&self, tx: &Transaction, _store: &dyn Store) -> Result<Vec<Record>, ProcessorError> {
        diff_cells::<SporeData>(tx, &self.codec)
            .into_iter()
            .map(|change| -> Result<Record, ProcessorError> {
                let event = asset_event(&tx.hash, change);
                let key = event_key(&tx.hash, &event.spore_id);
                Ok(Record::new(key, event_value(&event.spore_id, &event)?))
            })
            .collect()
    }
}

// ==================== collection family ====================

/// Create and transfer events for cluster cells. Clusters are never destroyed.
pub struct ClusterDeriver {
    codec: Arc<AddressCodec>,
}

impl ClusterDeriver {
    pub fn new(codec: Arc<AddressCodec>) -> Self {
        Self { codec }
    }
}

fn collection_event(tx_hash: &str, change: CellChange<ClusterData>) -> Option<CollectionEvent> {
    let (operation, cluster_id, from, to, data) = match change {
        CellChange::Created { identifier, to, data } => (CollectionOperation::Create, identifier, None, to, data),
        CellChange::Transferred {
            identifier,
            from,
            to,
            data,
        } => (CollectionOperation::Transfer, identifier, Some(from), to, data),
        CellChange::Destroyed { identifier, .. } => {
            debug!(%tx_hash, %identifier, "Cluster consumed without output, no event");
            return None;
        }
    };

    Some(CollectionEvent {
        tx_hash: tx_hash.to_string(),
        operation,
        cluster_id,
        from_address: from,
        to_address: to,
        name: data.name,
        description: data.description,
    })
}

#[async_trait]
impl Derive for ClusterDeriver {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn collection(&self) -> &'static str {
        CLUSTER_EVENTS
    }

    async fn derive(&self, tx: &Transaction, _store: &dyn Store) -> Result<Vec<Record>, ProcessorError> {
        diff_cells::<ClusterData>(tx, &self.codec)
            .into_iter()
            .filter_map(|change| collection_event(&tx.hash, change))
            .map(|event| -> Result<Record, ProcessorError> {
                let key = event_key(&tx.hash, &event.cluster_id);
                Ok(Record::new(key, event_value(&event.cluster_id, &event)?))
            })
            .collect()
    }
}

// ==================== generic movement ====================

/// One movement record per transaction listing every party
pub struct GenericDeriver {
    codec: Arc<AddressCodec>,
}

impl GenericDeriver {
    pub fn new(codec: Arc<AddressCodec>) -> Self {
        Self { codec }
    }

    fn party(&self, cell: &Cell) -> Result<(Party, u64), ProcessorError> {
        let lock = cell.lock_script()?;
        let capacity = parse_capacity(&cell.capacity)?;
        let type_hash = cell
            .type_script()?
            .map(|script| self.codec.script_hash(&script).to_string());

        let party = Party {
            address: self.codec.address(&lock)?,
            capacity: capacity.to_string(),
            lock_hash: self.codec.script_hash(&lock).to_string(),
            type_hash,
        };
        Ok((party, capacity))
    }

    /// Parties of `cells`, skipping malformed ones, and their total capacity
    fn parties(&self, tx: &Transaction, cells: &[Cell], side: &'static str) -> (Vec<Party>, u128) {
        let mut parties = Vec::with_capacity(cells.len());
        let mut total: u128 = 0;
        for (index, cell) in cells.iter().enumerate() {
            match self.party(cell) {
                Ok((party, capacity)) => {
                    total += u128::from(capacity);
                    parties.push(party);
                }
                Err(e) => warn!(tx_hash = %tx.hash, index, side, error = %e, "Skipping malformed cell"),
            }
        }
        (parties, total)
    }
}

#[async_trait]
impl Derive for GenericDeriver {
    fn name(&self) -> &'static str {
        "anyway"
    }

    fn collection(&self) -> &'static str {
        TRANSACTIONS
    }

    async fn derive(&self, tx: &Transaction, store: &dyn Store) -> Result<Vec<Record>, ProcessorError> {
        let (input_parties, _) = self.parties(tx, &tx.inputs, "input");
        let (output_parties, total_capacity) = self.parties(tx, &tx.outputs, "output");

        // a confirmation written by another writer must survive re-delivery
        let existing = store
            .find(TRANSACTIONS, &tx.hash)
            .await?
            .and_then(|doc| serde_json::from_value::<MovementRecord>(doc).ok());
        let (status, timestamp) = match existing {
            Some(record) => (record.status, record.timestamp),
            None => (MovementStatus::Pending, current_timestamp_millis()),
        };

        let record = MovementRecord {
            tx_hash: tx.hash.clone(),
            total_capacity: total_capacity.to_string(),
            input_parties,
            output_parties,
            status,
            timestamp,
        };
        Ok(vec![Record::new(tx.hash.clone(), serde_json::to_value(&record)?)])
    }
}

// ==================== deposit / withdraw ====================

/// Nervos DAO deposits and withdrawals
#[derive(Debug, Default)]
pub struct DaoDeriver;

/// Deposit cells carry eight zero bytes
fn is_deposit_data(data: &[u8]) -> bool {
    data.len() == 8 && data.iter().all(|b| *b == 0)
}

fn is_dao_cell(cell: &Cell) -> bool {
    matches!(cell.type_script(), Ok(Some(script)) if script.code_hash == DAO_CODE_HASH)
}

fn total_capacity<'a>(mut cells: impl Iterator<Item = &'a Cell>) -> Result<u128, ScriptError> {
    cells.try_fold(0u128, |sum, cell| Ok(sum + u128::from(parse_capacity(&cell.capacity)?)))
}

#[async_trait]
impl Derive for DaoDeriver {
    fn name(&self) -> &'static str {
        "dao"
    }

    fn collection(&self) -> &'static str {
        DAO_TRANSACTIONS
    }

    async fn derive(&self, tx: &Transaction, _store: &dyn Store) -> Result<Vec<Record>, ProcessorError> {
        let dao_outputs: Vec<usize> = tx
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, cell)| is_dao_cell(cell))
            .map(|(index, _)| index)
            .collect();
        let dao_inputs: Vec<&Cell> = tx.inputs.iter().filter(|cell| is_dao_cell(cell)).collect();

        let (operation, capacity) = if !dao_outputs.is_empty() {
            let mut deposit = false;
            for index in &dao_outputs {
                if is_deposit_data(&tx.output_data(*index)?) {
                    deposit = true;
                }
            }
            let operation = if deposit {
                DaoOperation::Deposit
            } else {
                DaoOperation::Withdraw
            };
            (operation, total_capacity(dao_outputs.iter().map(|i| &tx.outputs[*i]))?)
        } else if !dao_inputs.is_empty() {
            (DaoOperation::Withdraw, total_capacity(dao_inputs.into_iter())?)
        } else {
            return Ok(Vec::new());
        };

        let record = DaoRecord {
            hash: tx.hash.clone(),
            operation,
            capacity: capacity.to_string(),
            timestamp: current_timestamp_millis(),
            processed: false,
        };
        Ok(vec![Record::new(tx.hash.clone(), serde_json::to_value(&record)?)])
    }
}

/// Build the processor registered under `name`
///
/// # Returns
/// `None` if no processor is registered under that name
pub fn build_processor(name: &str, store: Arc<dyn Store>, codec: Arc<AddressCodec>) -> Option<Arc<dyn Processor>> {
    let processor: Arc<dyn Processor> = match name {
        "spore" | "asset" => Arc::new(EventProcessor::new(SporeDeriver::new(codec), store)),
        "cluster" | "collection" => Arc::new(EventProcessor::new(ClusterDeriver::new(codec), store)),
        "anyway" | "generic" => Arc::new(EventProcessor::new(GenericDeriver::new(codec), store)),
        "dao" => Arc::new(EventProcessor::new(DaoDeriver, store)),
        _ => return None,
    };
    Some(processor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Network, CLUSTER_MAINNET, SPORE_MAINNET};
    use crate::script::{HashType, Script, H256};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn codec() -> Arc<AddressCodec> {
        Arc::new(AddressCodec::with_default_hasher(Network::Mainnet))
    }

    fn lock(owner: u8) -> Script {
        Script::new(H256([0x9b; 32]), HashType::Type, vec![owner; 20])
    }

    fn cell(owner: u8, capacity: &str, type_script: Option<Script>) -> Cell {
        Cell {
            capacity: capacity.to_string(),
            lock: lock(owner).to_raw(),
            type_script: type_script.map(|s| s.to_raw()),
            data: None,
            previous_output: None,
            since: None,
        }
    }

    fn tx(inputs: Vec<Cell>, outputs: Vec<(Cell, Vec<u8>)>) -> Transaction {
        let (outputs, data): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
        Transaction {
            hash: "0x77".to_string(),
            version: "0x0".to_string(),
            cell_deps: vec![],
            header_deps: vec![],
            inputs,
            outputs,
            outputs_data: data.iter().map(|d| format!("0x{}", hex::encode(d))).collect(),
            witnesses: vec![],
        }
    }

    fn spore_payload() -> Vec<u8> {
        SporeData {
            content_type: "image/svg+xml".to_string(),
            content: b"<svg/>".to_vec(),
            cluster_id: Some(vec![0x0c; 32]),
        }
        .encode()
    }

    fn dao() -> Script {
        Script::new(DAO_CODE_HASH, HashType::Type, vec![])
    }

    async fn process(name: &str, store: &Arc<MemoryStore>, tx: &Transaction) -> Option<Value> {
        let processor = build_processor(name, store.clone(), codec()).unwrap();
        processor.process(tx).await.unwrap()
    }

    // ==================== registry tests ====================

    #[test]
    fn test_registry_resolves_every_name_and_alias() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        for name in PROCESSOR_NAMES.iter().chain(["asset", "collection", "generic"].iter()) {
            assert!(build_processor(name, store.clone(), codec()).is_some(), "{name}");
        }
        assert!(build_processor("nft", store, codec()).is_none());
    }

    #[test]
    fn test_processor_reports_canonical_name() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert_eq!(build_processor("asset", store, codec()).unwrap().name(), "spore");
    }

    // ==================== spore tests ====================

    #[tokio::test]
    async fn test_spore_mint_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let spore = Script::new(SPORE_MAINNET, HashType::Data1, vec![0xaa; 32]);
        let transaction = tx(vec![], vec![(cell(1, "100", Some(spore)), spore_payload())]);

        let first = process("spore", &store, &transaction).await.unwrap();
        assert_eq!(first["operation"], "mint");
        assert_eq!(first["contentType"], "image/svg+xml");
        assert_eq!(first["content"], format!("0x{}", hex::encode(b"<svg/>")));
        assert_eq!(first["clusterId"], format!("0x{}", "0c".repeat(32)));
        assert!(first.get("fromAddress").is_none());

        let key = event_key("0x77", &format!("0x{}", "aa".repeat(32)));
        assert_eq!(store.find(SPORE_EVENTS, &key).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_spore_melt_without_payload_has_empty_content() {
        let store = Arc::new(MemoryStore::new());
        let spore = Script::new(SPORE_MAINNET, HashType::Data1, vec![0xaa; 32]);
        let transaction = tx(vec![cell(1, "100", Some(spore))], vec![]);

        let melt = process("spore", &store, &transaction).await.unwrap();
        assert_eq!(melt["operation"], "melt");
        assert_eq!(melt["content"], "");
        assert!(melt.get("toAddress").is_none());
        assert!(melt["fromAddress"].as_str().unwrap().starts_with("ckb1"));
    }

    #[tokio::test]
    async fn test_no_events_returns_none() {
        let store = Arc::new(MemoryStore::new());
        let transaction = tx(vec![], vec![(cell(1, "100", None), vec![])]);
        assert_eq!(process("spore", &store, &transaction).await, None);
        assert!(store.is_empty());
    }

    // ==================== cluster tests ====================

    #[tokio::test]
    async fn test_cluster_transfer() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Script::new(CLUSTER_MAINNET, HashType::Data1, vec![0xcc; 32]);
        let payload = ClusterData {
            name: "Gallery".to_string(),
            description: "Pieces".to_string(),
        }
        .encode();
        let mut input = cell(1, "100", Some(cluster.clone()));
        input.data = Some(format!("0x{}", hex::encode(&payload)));
        let transaction = tx(vec![input], vec![(cell(2, "100", Some(cluster)), payload)]);

        let event = process("cluster", &store, &transaction).await.unwrap();
        assert_eq!(event["operation"], "transfer");
        assert_eq!(event["name"], "Gallery");
        assert_ne!(event["fromAddress"], event["toAddress"]);
    }

    #[tokio::test]
    async fn test_cluster_input_only_yields_no_event() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Script::new(CLUSTER_MAINNET, HashType::Data1, vec![0xcc; 32]);
        let transaction = tx(vec![cell(1, "100", Some(cluster))], vec![]);
        assert_eq!(process("cluster", &store, &transaction).await, None);
    }

    // ==================== generic tests ====================

    #[tokio::test]
    async fn test_generic_record_lists_parties() {
        let store = Arc::new(MemoryStore::new());
        let transaction = tx(
            vec![cell(1, "0x2540be400", None)],
            vec![
                (cell(2, "6000000000", None), vec![]),
                (cell(3, "3999990000", Some(dao())), vec![]),
            ],
        );

        let record = process("anyway", &store, &transaction).await.unwrap();
        assert_eq!(record["txHash"], "0x77");
        assert_eq!(record["totalCapacity"], "9999990000");
        assert_eq!(record["status"], "pending");
        assert_eq!(record["inputParties"][0]["capacity"], "10000000000");
        assert_eq!(record["outputParties"].as_array().unwrap().len(), 2);
        assert!(record["outputParties"][0].get("typeHash").is_none());
        assert!(record["outputParties"][1]["typeHash"].as_str().unwrap().starts_with("0x"));
    }

    #[tokio::test]
    async fn test_generic_preserves_confirmed_status_and_first_seen() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert(
                TRANSACTIONS,
                "0x77",
                json!({
                    "txHash": "0x77",
                    "totalCapacity": "1",
                    "inputParties": [],
                    "outputParties": [],
                    "status": "confirmed",
                    "timestamp": 42
                }),
            )
            .await
            .unwrap();

        let transaction = tx(vec![], vec![(cell(2, "100", None), vec![])]);
        let record = process("anyway", &store, &transaction).await.unwrap();
        assert_eq!(record["status"], "confirmed");
        assert_eq!(record["timestamp"], 42);
        assert_eq!(record["totalCapacity"], "100");
    }

    #[tokio::test]
    async fn test_generic_skips_malformed_capacity() {
        let store = Arc::new(MemoryStore::new());
        let transaction = tx(
            vec![],
            vec![(cell(2, "many", None), vec![]), (cell(3, "5", None), vec![])],
        );
        let record = process("anyway", &store, &transaction).await.unwrap();
        assert_eq!(record["totalCapacity"], "5");
        assert_eq!(record["outputParties"].as_array().unwrap().len(), 1);
    }

    // ==================== dao tests ====================

    #[tokio::test]
    async fn test_dao_deposit() {
        let store = Arc::new(MemoryStore::new());
        let transaction = tx(vec![], vec![(cell(1, "10200000000", Some(dao())), vec![0u8; 8])]);
        let record = process("dao", &store, &transaction).await.unwrap();
        assert_eq!(record["type"], "deposit");
        assert_eq!(record["capacity"], "10200000000");
        assert_eq!(record["processed"], false);
    }

    #[tokio::test]
    async fn test_dao_withdraw_phase_one() {
        let store = Arc::new(MemoryStore::new());
        let block_number = 1_234_567u64.to_le_bytes().to_vec();
        let transaction = tx(
            vec![cell(1, "10200000000", Some(dao()))],
            vec![(cell(1, "10200000000", Some(dao())), block_number)],
        );
        let record = process("dao", &store, &transaction).await.unwrap();
        assert_eq!(record["type"], "withdraw");
    }

    #[tokio::test]
    async fn test_dao_withdraw_phase_two_uses_input_capacity() {
        let store = Arc::new(MemoryStore::new());
        let transaction = tx(
            vec![cell(1, "10200000000", Some(dao()))],
            vec![(cell(1, "10250000000", None), vec![])],
        );
        let record = process("dao", &store, &transaction).await.unwrap();
        assert_eq!(record["type"], "withdraw");
        assert_eq!(record["capacity"], "10200000000");
    }

    #[tokio::test]
    async fn test_dao_ignores_unrelated_transactions() {
        let store = Arc::new(MemoryStore::new());
        let transaction = tx(vec![cell(1, "1", None)], vec![(cell(2, "1", None), vec![])]);
        assert_eq!(process("dao", &store, &transaction).await, None);
    }

    #[test]
    fn test_deposit_data_detection() {
        assert!(is_deposit_data(&[0u8; 8]));
        assert!(!is_deposit_data(&[0u8; 7]));
        assert!(!is_deposit_data(&1u64.to_le_bytes()));
    }
}
