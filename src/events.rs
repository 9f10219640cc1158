//! Derived Event Documents
//!
//! The documents persisted for matched transactions. Each family has its own collection;
//! all documents serialize with camelCase field names.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Collection holding asset (spore) events
pub const SPORE_EVENTS: &str = "spore_events";

/// Collection holding collection (cluster) events
pub const CLUSTER_EVENTS: &str = "cluster_events";

/// Collection holding one movement record per transaction
pub const TRANSACTIONS: &str = "transactions";

/// Collection holding deposit/withdraw records
pub const DAO_TRANSACTIONS: &str = "dao_transactions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetOperation {
    Mint,
    Transfer,
    Melt,
}

/// Asset lifecycle event. `fromAddress` is absent for mints, `toAddress` is absent for melts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetEvent {
    pub tx_hash: String,
    pub operation: AssetOperation,
    pub spore_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_address: Option<String>,
    pub content_type: String,
    /// 0x-prefixed hex
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionOperation {
    Create,
    Transfer,
}

/// Collection lifecycle event. `fromAddress` is absent for creations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionEvent {
    pub tx_hash: String,
    pub operation: CollectionOperation,
    pub cluster_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    pub to_address: String,
    pub name: String,
    pub description: String,
}

/// One side of a value movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub address: String,
    /// Shannons, decimal
    pub capacity: String,
    pub lock_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementStatus {
    Pending,
    Confirmed,
}

/// Generic value movement, one per transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementRecord {
    pub tx_hash: String,
    /// Sum of output capacities in shannons, decimal
    pub total_capacity: String,
    pub input_parties: Vec<Party>,
    pub output_parties: Vec<Party>,
    pub status: MovementStatus,
    /// Unix milliseconds when the transaction was first seen
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaoOperation {
    Deposit,
    Withdraw,
}

/// Nervos DAO deposit or withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaoRecord {
    pub hash: String,
    #[serde(rename = "type")]
    pub operation: DaoOperation,
    /// Capacity of the DAO cells involved, decimal shannons
    pub capacity: String,
    pub timestamp: u64,
    pub processed: bool,
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== AssetEvent tests ====================

    #[test]
    fn test_asset_mint_omits_from() {
        let event = AssetEvent {
            tx_hash: "0x01".to_string(),
            operation: AssetOperation::Mint,
            spore_id: "0xaa".to_string(),
            from_address: None,
            to_address: Some("ckb1qq".to_string()),
            content_type: "text/plain".to_string(),
            content: "0x6869".to_string(),
            cluster_id: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operation"], "mint");
        assert_eq!(json["sporeId"], "0xaa");
        assert_eq!(json["contentType"], "text/plain");
        assert!(json.get("fromAddress").is_none());
        assert_eq!(json["toAddress"], "ckb1qq");
        assert!(json.get("clusterId").is_none());
    }

    // ==================== MovementRecord tests ====================

    #[test]
    fn test_movement_record_camel_case() {
        let record = MovementRecord {
            tx_hash: "0x01".to_string(),
            total_capacity: "100".to_string(),
            input_parties: vec![],
            output_parties: vec![Party {
                address: "ckb1qq".to_string(),
                capacity: "100".to_string(),
                lock_hash: "0x02".to_string(),
                type_hash: None,
            }],
            status: MovementStatus::Pending,
            timestamp: 1_700_000_000_000,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["txHash"], "0x01");
        assert_eq!(json["totalCapacity"], "100");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["outputParties"][0]["lockHash"], "0x02");
        assert_eq!(serde_json::from_value::<MovementRecord>(json).unwrap(), record);
    }

    // ==================== DaoRecord tests ====================

    #[test]
    fn test_dao_record_type_field() {
        let record = DaoRecord {
            hash: "0x01".to_string(),
            operation: DaoOperation::Deposit,
            capacity: "10200000000".to_string(),
            timestamp: 0,
            processed: false,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "deposit");
        assert_eq!(json["processed"], false);
    }

    #[test]
    fn test_current_timestamp_is_recent() {
        // 2023-11-14 in milliseconds
        assert!(current_timestamp_millis() > 1_700_000_000_000);
    }
}
