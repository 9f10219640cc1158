//! Cell Diff Engine
//!
//! Classifies identity-bearing cells of one tracked family into creations, transfers and
//! destructions by diffing a transaction's inputs against its outputs.
//!
//! Tracked inputs are collected into an incoming map and tracked outputs into an outgoing
//! map, both keyed by identifier (the type script args). An identifier on both sides is a
//! transfer, one only on the input side is destroyed, one only on the output side is created.
//! An identifier whose only outputs carry an unreadable payload yields no change at all.

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use crate::address::AddressCodec;
use crate::network::Family;
use crate::payload::{ClusterData, PayloadError, SporeData};
use crate::script::{Cell, Transaction};

/// Payload shape decoded from a tracked family's cell data
pub trait FamilyPayload: Sized {
    const FAMILY: Family;

    fn decode(bytes: &[u8]) -> Result<Self, PayloadError>;
}

impl FamilyPayload for SporeData {
    const FAMILY: Family = Family::Asset;

    fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        SporeData::decode(bytes)
    }
}

impl FamilyPayload for ClusterData {
    const FAMILY: Family = Family::Collection;

    fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        ClusterData::decode(bytes)
    }
}

/// What happened to one identifier in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellChange<T> {
    Created {
        identifier: String,
        to: String,
        data: T,
    },
    Transferred {
        identifier: String,
        from: String,
        to: String,
        data: T,
    },
    /// `data` is `None` when the consumed cell's payload is unavailable or undecodable
    Destroyed {
        identifier: String,
        from: String,
        data: Option<T>,
    },
}

impl<T> CellChange<T> {
    pub fn identifier(&self) -> &str {
        match self {
            CellChange::Created { identifier, .. }
            | CellChange::Transferred { identifier, .. }
            | CellChange::Destroyed { identifier, .. } => identifier,
        }
    }
}

#[derive(Debug)]
struct TrackedCell<D> {
    owner: String,
    data: D,
}

#[derive(Clone, Copy)]
enum Side {
    Input,
    Output,
}

impl Side {
    fn as_str(&self) -> &'static str {
        match self {
            Side::Input => "input",
            Side::Output => "output",
        }
    }
}

/// Diff the tracked cells of `T::FAMILY` in `tx`
///
/// Malformed cells are skipped individually and never fail the transaction. Transfers and
/// destructions come first in input order, followed by creations in output order.
///
/// # Arguments
/// * `tx` - The transaction to classify
/// * `codec` - Address codec; its network selects the family's code hash table
pub fn diff_cells<T: FamilyPayload>(tx: &Transaction, codec: &AddressCodec) -> Vec<CellChange<T>> {
    let mut incoming: IndexMap<String, TrackedCell<Option<T>>> = IndexMap::new();
    for (index, cell) in tx.inputs.iter().enumerate() {
        let Some(identifier) = tracked_identifier::<T>(tx, cell, index, Side::Input, codec) else {
            continue;
        };
        let Some(owner) = owner_address(tx, cell, index, Side::Input, codec) else {
            continue;
        };
        let data = match tx.input_data(index).map_err(|e| e.to_string()).and_then(|bytes| {
            T::decode(&bytes).map_err(|e| e.to_string())
        }) {
            Ok(data) => Some(data),
            Err(reason) => {
                debug!(tx_hash = %tx.hash, index, %identifier, %reason, "Input payload unavailable");
                None
            }
        };
        insert_tracked(&mut incoming, tx, identifier, TrackedCell { owner, data }, Side::Input);
    }

    let mut outgoing: IndexMap<String, TrackedCell<T>> = IndexMap::new();
    // still on chain, but without a payload to report
    let mut unreadable: IndexSet<String> = IndexSet::new();
    for (index, cell) in tx.outputs.iter().enumerate() {
        let Some(identifier) = tracked_identifier::<T>(tx, cell, index, Side::Output, codec) else {
            continue;
        };
        let Some(owner) = owner_address(tx, cell, index, Side::Output, codec) else {
            continue;
        };
        let decoded = tx
            .output_data(index)
            .map_err(|e| e.to_string())
            .and_then(|bytes| T::decode(&bytes).map_err(|e| e.to_string()));
        match decoded {
            Ok(data) => insert_tracked(
                &mut outgoing,
                tx,
                identifier,
                TrackedCell { owner, data },
                Side::Output,
            ),
            Err(reason) => {
                warn!(
                    tx_hash = %tx.hash,
                    index,
                    %identifier,
                    family = T::FAMILY.name(),
                    %reason,
                    "Skipping output with malformed payload"
                );
                unreadable.insert(identifier);
            }
        }
    }

    let mut changes = Vec::with_capacity(incoming.len() + outgoing.len());
    for (identifier, input) in incoming {
        match outgoing.shift_remove(&identifier) {
            Some(output) => changes.push(CellChange::Transferred {
                identifier,
                from: input.owner,
                to: output.owner,
                data: output.data,
            }),
            None if unreadable.contains(&identifier) => {
                warn!(tx_hash = %tx.hash, %identifier, "Tracked cell kept with unreadable payload, no event");
            }
            None => changes.push(CellChange::Destroyed {
                identifier,
                from: input.owner,
                data: input.data,
            }),
        }
    }

    for (identifier, output) in outgoing {
        changes.push(CellChange::Created {
            identifier,
            to: output.owner,
            data: output.data,
        });
    }

    changes
}

/// Identifier of `cell` if its type script belongs to the tracked family
fn tracked_identifier<T: FamilyPayload>(
    tx: &Transaction,
    cell: &Cell,
    index: usize,
    side: Side,
    codec: &AddressCodec,
) -> Option<String> {
    match cell.type_script() {
        Ok(Some(script)) if T::FAMILY.is_member(codec.network(), &script.code_hash) => {
            Some(script.args_hex())
        }
        Ok(_) => None,
        Err(e) => {
            debug!(tx_hash = %tx.hash, index, side = side.as_str(), error = %e, "Malformed type script");
            None
        }
    }
}

fn owner_address(
    tx: &Transaction,
    cell: &Cell,
    index: usize,
    side: Side,
    codec: &AddressCodec,
) -> Option<String> {
    let result = cell
        .lock_script()
        .map_err(|e| e.to_string())
        .and_then(|lock| codec.address(&lock).map_err(|e| e.to_string()));
    match result {
        Ok(address) => Some(address),
        Err(reason) => {
            warn!(tx_hash = %tx.hash, index, side = side.as_str(), %reason, "Skipping cell with invalid lock");
            None
        }
    }
}

fn insert_tracked<D>(
    map: &mut IndexMap<String, TrackedCell<D>>,
    tx: &Transaction,
    identifier: String,
    cell: TrackedCell<D>,
    side: Side,
) {
    if map.contains_key(&identifier) {
        warn!(
            tx_hash = %tx.hash,
            %identifier,
            side = side.as_str(),
            "Duplicate identifier, keeping the later cell"
        );
    }
    map.insert(identifier, cell);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Network, CLUSTER_MAINNET, SPORE_MAINNET, SPORE_TESTNET};
    use crate::script::{HashType, Script, H256};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn codec() -> AddressCodec {
        AddressCodec::with_default_hasher(Network::Mainnet)
    }

    fn spore_cell(owner: u8, id: u8) -> Cell {
        Cell {
            capacity: "30000000000".to_string(),
            lock: Script::new(H256([0x9b; 32]), HashType::Type, vec![owner; 20]).to_raw(),
            type_script: Some(Script::new(SPORE_MAINNET, HashType::Data1, vec![id; 32]).to_raw()),
            data: None,
            previous_output: None,
            since: None,
        }
    }

    fn payload(content: &str) -> String {
        let bytes = SporeData {
            content_type: "text/plain".to_string(),
            content: content.as_bytes().to_vec(),
            cluster_id: None,
        }
        .encode();
        format!("0x{}", hex::encode(bytes))
    }

    fn tx(inputs: Vec<Cell>, outputs: Vec<(Cell, String)>) -> Transaction {
        let (outputs, outputs_data) = outputs.into_iter().unzip();
        Transaction {
            hash: "0xabc".to_string(),
            version: "0x0".to_string(),
            cell_deps: vec![],
            header_deps: vec![],
            inputs,
            outputs,
            outputs_data,
            witnesses: vec![],
        }
    }

    fn with_data(mut cell: Cell, data: String) -> Cell {
        cell.data = Some(data);
        cell
    }

    fn id(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    fn owner(byte: u8) -> String {
        let lock = Script::new(H256([0x9b; 32]), HashType::Type, vec![byte; 20]);
        codec().address(&lock).unwrap()
    }

    // ==================== classification tests ====================

    #[test]
    fn test_output_only_is_created() {
        let changes = diff_cells::<SporeData>(&tx(vec![], vec![(spore_cell(1, 0xaa), payload("a"))]), &codec());
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            CellChange::Created { identifier, to, data } => {
                assert_eq!(identifier, &id(0xaa));
                assert_eq!(to, &owner(1));
                assert_eq!(data.content, b"a");
            }
            other => panic!("expected creation, got {other:?}"),
        }
    }

    #[test]
    fn test_input_only_is_destroyed() {
        let input = with_data(spore_cell(2, 0xbb), payload("gone"));
        let changes = diff_cells::<SporeData>(&tx(vec![input], vec![]), &codec());
        assert_eq!(
            changes,
            vec![CellChange::Destroyed {
                identifier: id(0xbb),
                from: owner(2),
                data: Some(SporeData {
                    content_type: "text/plain".to_string(),
                    content: b"gone".to_vec(),
                    cluster_id: None,
                }),
            }]
        );
    }

    #[test]
    fn test_both_sides_is_single_transfer() {
        let input = with_data(spore_cell(1, 0xcc), payload("old"));
        let output = (spore_cell(2, 0xcc), payload("new"));
        let changes = diff_cells::<SporeData>(&tx(vec![input], vec![output]), &codec());

        assert_eq!(changes.len(), 1);
        match &changes[0] {
            CellChange::Transferred { from, to, data, .. } => {
                assert_eq!(from, &owner(1));
                assert_eq!(to, &owner(2));
                // data comes from the output side
                assert_eq!(data.content, b"new");
            }
            other => panic!("expected transfer, got {other:?}"),
        }
    }

    #[test]
    fn test_one_change_per_distinct_identifier() {
        let inputs = vec![
            with_data(spore_cell(1, 0x01), payload("x")),
            with_data(spore_cell(1, 0x02), payload("y")),
        ];
        let outputs = vec![
            (spore_cell(2, 0x02), payload("y")),
            (spore_cell(2, 0x03), payload("z")),
        ];
        let changes = diff_cells::<SporeData>(&tx(inputs, outputs), &codec());

        let ids: Vec<&str> = changes.iter().map(CellChange::identifier).collect();
        assert_eq!(ids, vec![id(0x01), id(0x02), id(0x03)]);
        assert!(matches!(changes[0], CellChange::Destroyed { .. }));
        assert!(matches!(changes[1], CellChange::Transferred { .. }));
        assert!(matches!(changes[2], CellChange::Created { .. }));
    }

    #[test]
    fn test_no_tracked_cells_yields_nothing() {
        let mut plain = spore_cell(1, 0x01);
        plain.type_script = None;
        let changes = diff_cells::<SporeData>(&tx(vec![plain.clone()], vec![(plain, "0x".to_string())]), &codec());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_other_network_digest_is_ignored() {
        let mut cell = spore_cell(1, 0x01);
        cell.type_script = Some(Script::new(SPORE_TESTNET[0], HashType::Data1, vec![0x01; 32]).to_raw());
        let changes = diff_cells::<SporeData>(&tx(vec![], vec![(cell, payload("a"))]), &codec());
        assert!(changes.is_empty());
    }

    // ==================== malformed input tests ====================

    #[test]
    fn test_malformed_output_payload_skips_only_that_output() {
        let outputs = vec![
            (spore_cell(1, 0x01), "0xdeadbeef".to_string()),
            (spore_cell(1, 0x02), payload("ok")),
        ];
        let changes = diff_cells::<SporeData>(&tx(vec![], outputs), &codec());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].identifier(), id(0x02));
    }

    #[test]
    fn test_malformed_output_of_consumed_cell_is_not_destroyed() {
        let input = with_data(spore_cell(1, 0x5a), payload("still here"));
        let output = (spore_cell(2, 0x5a), "0xdeadbeef".to_string());
        let changes = diff_cells::<SporeData>(&tx(vec![input], vec![output]), &codec());
        assert!(changes.is_empty(), "unexpected changes: {changes:?}");
    }

    #[test]
    fn test_later_valid_output_wins_over_malformed_one() {
        let input = with_data(spore_cell(1, 0x5b), payload("a"));
        let outputs = vec![
            (spore_cell(2, 0x5b), "0xdeadbeef".to_string()),
            (spore_cell(3, 0x5b), payload("b")),
        ];
        let changes = diff_cells::<SporeData>(&tx(vec![input], outputs), &codec());
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], CellChange::Transferred { to, .. } if to == &owner(3)));
    }

    #[test]
    fn test_undecodable_input_still_destroyed() {
        let input = with_data(spore_cell(1, 0x05), "0x00".to_string());
        let changes = diff_cells::<SporeData>(&tx(vec![input], vec![]), &codec());
        assert!(matches!(&changes[0], CellChange::Destroyed { data: None, .. }));
    }

    #[test]
    fn test_input_payload_falls_back_to_outputs_data_index() {
        let input = spore_cell(1, 0x07);
        let unrelated_output = (spore_cell(3, 0x08), payload("fallback"));
        let changes = diff_cells::<SporeData>(&tx(vec![input], vec![unrelated_output]), &codec());
        match &changes[0] {
            CellChange::Destroyed { data: Some(data), .. } => assert_eq!(data.content, b"fallback"),
            other => panic!("expected destruction with data, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_lock_skips_cell() {
        let mut cell = spore_cell(1, 0x01);
        cell.lock.args = None;
        let changes = diff_cells::<SporeData>(&tx(vec![], vec![(cell, payload("a"))]), &codec());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_duplicate_identifier_last_write_wins() {
        let outputs = vec![
            (spore_cell(1, 0x01), payload("first")),
            (spore_cell(2, 0x01), payload("second")),
        ];
        let changes = diff_cells::<SporeData>(&tx(vec![], outputs), &codec());
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            CellChange::Created { to, data, .. } => {
                assert_eq!(to, &owner(2));
                assert_eq!(data.content, b"second");
            }
            other => panic!("expected creation, got {other:?}"),
        }
    }

    // ==================== collection family tests ====================

    #[test]
    fn test_cluster_family_uses_its_own_digests() {
        let mut cell = spore_cell(1, 0x01);
        cell.type_script = Some(Script::new(CLUSTER_MAINNET, HashType::Data1, vec![0x01; 32]).to_raw());
        let data = ClusterData {
            name: "c".to_string(),
            description: "d".to_string(),
        };
        let transaction = tx(vec![], vec![(cell, format!("0x{}", hex::encode(data.encode())))]);

        assert!(diff_cells::<SporeData>(&transaction, &codec()).is_empty());
        let changes = diff_cells::<ClusterData>(&transaction, &codec());
        assert!(matches!(&changes[0], CellChange::Created { data: d, .. } if d == &data));
    }

    // ==================== property tests ====================

    fn kind<T>(change: &CellChange<T>) -> &'static str {
        match change {
            CellChange::Created { .. } => "created",
            CellChange::Transferred { .. } => "transferred",
            CellChange::Destroyed { .. } => "destroyed",
        }
    }

    proptest! {
        #[test]
        fn test_exactly_one_change_per_identifier(
            inputs in prop::collection::btree_set(0u8..16, 0..8),
            outputs in prop::collection::btree_set(0u8..16, 0..8),
        ) {
            let transaction = tx(
                inputs.iter().map(|i| with_data(spore_cell(1, *i), payload("in"))).collect(),
                outputs.iter().map(|o| (spore_cell(2, *o), payload("out"))).collect(),
            );
            let changes = diff_cells::<SporeData>(&transaction, &codec());

            let all: BTreeSet<u8> = inputs.union(&outputs).copied().collect();
            prop_assert_eq!(changes.len(), all.len());
            for byte in all {
                let identifier = id(byte);
                let matching: Vec<&CellChange<SporeData>> =
                    changes.iter().filter(|c| c.identifier() == identifier).collect();
                prop_assert_eq!(matching.len(), 1);

                let expected = match (inputs.contains(&byte), outputs.contains(&byte)) {
                    (true, true) => "transferred",
                    (true, false) => "destroyed",
                    _ => "created",
                };
                prop_assert_eq!(kind(matching[0]), expected);
            }
        }
    }
}
