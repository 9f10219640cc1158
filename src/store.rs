//! Event Store
//!
//! Narrow persistence contract used by the processors: keyed upsert and lookup of JSON
//! documents grouped by collection. [`RedisStore`] keeps each collection in one Redis hash,
//! [`MemoryStore`] backs tests and dry runs.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;
use thiserror::Error;

use crate::config::RedisConfig;

/// Errors that can occur while reading or writing documents
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A document waiting to be written under `key`
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub document: Value,
}

impl Record {
    pub fn new(key: impl Into<String>, document: Value) -> Self {
        Self {
            key: key.into(),
            document,
        }
    }
}

/// Keyed document persistence
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace the document at `key`, returning the stored document
    async fn upsert(&self, collection: &str, key: &str, document: Value) -> Result<Value, StoreError>;

    async fn find(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Upsert every record, returning the stored documents in input order
    async fn upsert_batch(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Value>, StoreError> {
        let mut saved = Vec::with_capacity(records.len());
        for record in records {
            saved.push(self.upsert(collection, &record.key, record.document).await?);
        }
        Ok(saved)
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: DashMap<(String, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All documents of `collection`, ordered by key
    pub fn documents(&self, collection: &str) -> Vec<(String, Value)> {
        let mut docs: Vec<(String, Value)> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert(&self, collection: &str, key: &str, document: Value) -> Result<Value, StoreError> {
        self.documents
            .insert((collection.to_string(), key.to_string()), document.clone());
        Ok(document)
    }

    async fn find(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .documents
            .get(&(collection.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }
}

/// Redis-backed store. Collection `c` lives in the hash `{prefix}:{c}`, one field per key.
pub struct RedisStore {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisStore {
    /// Create a store over an established connection
    pub fn new(connection: MultiplexedConnection, key_prefix: impl Into<String>) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.into(),
        }
    }

    /// Connect using the configured URL and key prefix
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, config.key_prefix.clone()))
    }

    pub fn hash_key(&self, collection: &str) -> String {
        format!("{}:{}", self.key_prefix, collection)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn upsert(&self, collection: &str, key: &str, document: Value) -> Result<Value, StoreError> {
        let body = serde_json::to_string(&document)?;
        let mut connection = self.connection.clone();
        let _: () = connection.hset(self.hash_key(collection), key, body).await?;
        Ok(document)
    }

    async fn find(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let mut connection = self.connection.clone();
        let body: Option<String> = connection.hget(self.hash_key(collection), key).await?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    /// All records go out in one MULTI/EXEC pipeline
    async fn upsert_batch(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Value>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let hash_key = self.hash_key(collection);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in &records {
            pipe.hset(&hash_key, &record.key, serde_json::to_string(&record.document)?)
                .ignore();
        }

        let mut connection = self.connection.clone();
        let _: () = pipe.query_async(&mut connection).await?;
        Ok(records.into_iter().map(|r| r.document).collect())
    }
}
