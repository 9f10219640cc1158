//! Ingestion Queue
//!
//! Single-consumer queue between the bus and the pipeline. Producers call
//! [`QueueHandle::submit`]; one drain task takes transactions in arrival order and runs
//! each to settlement before taking the next.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pipeline::{Pipeline, Settlement};
use crate::script::Transaction;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Ingestion queue is closed")]
    Closed,

    #[error("Drain task failed: {0}")]
    DrainFailed(#[from] tokio::task::JoinError),
}

/// Cloneable producer side of the queue
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::UnboundedSender<Transaction>,
}

impl QueueHandle {
    /// Append a transaction. Never blocks.
    pub fn submit(&self, tx: Transaction) -> Result<(), QueueError> {
        self.sender.send(tx).map_err(|_| QueueError::Closed)
    }
}

/// Summary returned once the drain task has finished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub transactions: u64,
    pub failed_invocations: u64,
}

pub struct IngestionQueue {
    handle: QueueHandle,
    drain: JoinHandle<DrainReport>,
}

impl IngestionQueue {
    /// Start the drain task
    pub fn start(pipeline: Arc<Pipeline>) -> Self {
        Self::start_with_observer(pipeline, None)
    }

    /// Start the drain task, sending every [`Settlement`] to `observer`
    pub fn start_with_observer(
        pipeline: Arc<Pipeline>,
        observer: Option<mpsc::UnboundedSender<Settlement>>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain(pipeline, receiver, observer));
        Self {
            handle: QueueHandle { sender },
            drain,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn submit(&self, tx: Transaction) -> Result<(), QueueError> {
        self.handle.submit(tx)
    }

    /// Stop accepting work and wait until every accepted transaction has settled
    ///
    /// Outstanding [`QueueHandle`] clones keep the queue open, so drop them first.
    pub async fn shutdown(self) -> Result<DrainReport, QueueError> {
        drop(self.handle);
        let report = self.drain.await?;
        info!(
            transactions = report.transactions,
            failed_invocations = report.failed_invocations,
            "Ingestion queue drained"
        );
        Ok(report)
    }
}

async fn drain(
    pipeline: Arc<Pipeline>,
    mut receiver: mpsc::UnboundedReceiver<Transaction>,
    observer: Option<mpsc::UnboundedSender<Settlement>>,
) -> DrainReport {
    let mut report = DrainReport::default();
    while let Some(tx) = receiver.recv().await {
        let settlement = pipeline.run(Arc::new(tx)).await;
        report.transactions += 1;
        report.failed_invocations += settlement.failed as u64;
        debug!(tx_hash = %settlement.tx_hash, "Dequeued transaction settled");

        if let Some(observer) = &observer {
            // observer may have gone away, the queue keeps draining
            let _ = observer.send(settlement);
        }
    }
    report
}
