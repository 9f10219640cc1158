//! Transaction Bus Subscriber
//!
//! Subscribes to the Redis pub/sub channel carrying raw transactions and hands every
//! parsed message to the ingestion queue. Lost connections are re-established with
//! exponential backoff; unparsable messages are logged and dropped.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::queue::{QueueError, QueueHandle};
use crate::script::Transaction;

/// Default channel carrying raw transactions
pub const DEFAULT_CHANNEL: &str = "ckb.transactions";

/// Maximum number of consecutive reconnection attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Initial backoff delay for reconnection
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay for reconnection
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Errors that end a subscription
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Subscription to {0} ended")]
    StreamEnded(String),

    #[error("Max reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Configuration for the bus subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Redis URL; falls back to the store's URL when absent
    pub url: Option<String>,
    pub channel: String,
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: None,
            channel: DEFAULT_CHANNEL.to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl BusConfig {
    /// Calculate backoff delay for a given attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff_ms.saturating_mul(2u64.pow(attempt.min(10)));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}

/// Outcome of handling one bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Submitted(String),
    Dropped(String),
}

/// Parse one message body and submit it
///
/// Parse failures drop the message. Only a closed queue is an error.
pub fn deliver(payload: &str, queue: &QueueHandle) -> Result<Delivery, QueueError> {
    match Transaction::from_json(payload) {
        Ok(tx) => {
            let hash = tx.hash.clone();
            queue.submit(tx)?;
            Ok(Delivery::Submitted(hash))
        }
        Err(e) => {
            warn!(error = %e, bytes = payload.len(), "Dropping unparsable bus message");
            Ok(Delivery::Dropped(e.to_string()))
        }
    }
}

/// Redis pub/sub subscriber with reconnection support
pub struct BusSubscriber {
    url: String,
    config: BusConfig,
    reconnect_attempts: u32,
}

impl BusSubscriber {
    pub fn new(url: impl Into<String>, config: BusConfig) -> Self {
        let url = config.url.clone().unwrap_or_else(|| url.into());
        Self {
            url,
            config,
            reconnect_attempts: 0,
        }
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Calculate delay before next reconnection attempt
    pub fn next_backoff_delay(&self) -> Duration {
        self.config.backoff_delay(self.reconnect_attempts)
    }

    /// Consume the channel until the queue closes or reconnection gives up
    pub async fn run(&mut self, queue: QueueHandle) -> Result<(), BusError> {
        loop {
            match self.subscribe_once(&queue).await {
                Err(BusError::Queue(e)) => return Err(BusError::Queue(e)),
                Err(e) => {
                    error!(channel = %self.config.channel, error = %e, "Bus subscription lost");
                }
                Ok(()) => {}
            }

            if self.reconnect_attempts >= self.config.max_reconnect_attempts {
                return Err(BusError::MaxReconnectAttemptsExceeded(self.config.max_reconnect_attempts));
            }
            let delay = self.next_backoff_delay();
            self.reconnect_attempts += 1;
            warn!(
                attempt = self.reconnect_attempts,
                max_attempts = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to bus"
            );
            sleep(delay).await;
        }
    }

    async fn subscribe_once(&mut self, queue: &QueueHandle) -> Result<(), BusError> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.config.channel).await?;

        self.reconnect_attempts = 0;
        info!(channel = %self.config.channel, "Subscribed to transaction bus");

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Dropping bus message with non-text payload");
                    continue;
                }
            };
            deliver(&payload, queue)?;
        }

        Err(BusError::StreamEnded(self.config.channel.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, TracingReporter};
    use crate::queue::IngestionQueue;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;

    fn empty_queue() -> IngestionQueue {
        let pipeline = Pipeline::new(vec![], RetryPolicy::default(), Arc::new(TracingReporter));
        IngestionQueue::start(Arc::new(pipeline))
    }

    // ==================== BusConfig tests ====================

    #[test]
    fn test_bus_config_default() {
        let config = BusConfig::default();
        assert_eq!(config.channel, DEFAULT_CHANNEL);
        assert_eq!(config.max_reconnect_attempts, MAX_RECONNECT_ATTEMPTS);
        assert!(config.url.is_none());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = BusConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_subscriber_prefers_bus_url() {
        let subscriber = BusSubscriber::new(
            "redis://store:6379",
            BusConfig {
                url: Some("redis://bus:6379".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(subscriber.url, "redis://bus:6379");
        assert_eq!(subscriber.next_backoff_delay(), Duration::from_millis(INITIAL_BACKOFF_MS));
    }

    // ==================== deliver tests ====================

    #[tokio::test]
    async fn test_deliver_submits_parsed_transaction() {
        let queue = empty_queue();
        let delivery = deliver(r#"{"hash": "0xfeed", "inputs": [], "outputs": []}"#, &queue.handle()).unwrap();
        assert_eq!(delivery, Delivery::Submitted("0xfeed".to_string()));

        let report = queue.shutdown().await.unwrap();
        assert_eq!(report.transactions, 1);
    }

    #[tokio::test]
    async fn test_deliver_drops_garbage() {
        let queue = empty_queue();
        let delivery = deliver("not json", &queue.handle()).unwrap();
        assert!(matches!(delivery, Delivery::Dropped(_)));

        let report = queue.shutdown().await.unwrap();
        assert_eq!(report.transactions, 0);
    }

    #[tokio::test]
    async fn test_run_gives_up_when_redis_unreachable() {
        let queue = empty_queue();
        let mut subscriber = BusSubscriber::new(
            "redis://127.0.0.1:1",
            BusConfig {
                max_reconnect_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..Default::default()
            },
        );

        let result = subscriber.run(queue.handle()).await;
        assert!(matches!(result, Err(BusError::MaxReconnectAttemptsExceeded(2))));
        assert_eq!(subscriber.reconnect_attempts(), 2);
    }
}
