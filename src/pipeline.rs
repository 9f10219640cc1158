//! Pipeline Orchestrator
//!
//! Runs one transaction through every configured route. A route pairs a [`Filter`] with
//! the [`Processor`] it feeds. Per transaction the pipeline moves through
//! `received -> filtering -> dispatching -> settled`:
//!
//! - filtering evaluates every filter; a filter error is reported and counts as no match
//! - dispatching runs every matched processor as its own task, each under the retry policy
//! - settled is reached once every task has succeeded or exhausted its retries
//!
//! Partial success is a normal outcome. Failures are handed to the [`ErrorReporter`] and
//! never propagate further.

use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::address::AddressCodec;
use crate::config::{AppConfig, ConfigError};
use crate::filter::{Filter, FilterError};
use crate::processor::{build_processor, Processor, ProcessorError};
use crate::retry::{with_retry, RetryPolicy};
use crate::script::Transaction;
use crate::store::Store;

/// Failures caught and reported by the orchestrator
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Filter {filter} failed: {source}")]
    Filter {
        filter: String,
        #[source]
        source: FilterError,
    },

    #[error("Processor {processor} failed after {attempts} attempts: {source}")]
    Processor {
        processor: String,
        attempts: u32,
        #[source]
        source: ProcessorError,
    },

    #[error("Processor {processor} task aborted: {reason}")]
    TaskAborted { processor: String, reason: String },
}

impl PipelineError {
    /// Short error kind used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Filter { .. } => "filter",
            PipelineError::Processor { .. } | PipelineError::TaskAborted { .. } => "processor",
        }
    }

    /// Offending identifier, when the failure concerns a single tracked cell
    pub fn identifier(&self) -> Option<&str> {
        match self {
            PipelineError::Processor { source, .. } => source.identifier(),
            _ => None,
        }
    }
}

/// Lifecycle of one transaction inside the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Filtering,
    Dispatching,
    Settled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Filtering => "filtering",
            Stage::Dispatching => "dispatching",
            Stage::Settled => "settled",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a reported failure happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportContext {
    pub tx_hash: String,
    pub stage: Stage,
    /// Filter or processor name
    pub component: String,
    pub identifier: Option<String>,
}

/// Sink for caught filter and processor failures. Must not panic.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &PipelineError, context: &ReportContext);
}

/// Reports failures as `error!` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &PipelineError, context: &ReportContext) {
        error!(
            tx_hash = %context.tx_hash,
            stage = %context.stage,
            component = %context.component,
            identifier = context.identifier.as_deref(),
            kind = error.kind(),
            error = %error,
            "Pipeline failure"
        );
    }
}

/// A filter and the processor its matches go to
#[derive(Clone)]
pub struct Route {
    pub filter: Filter,
    pub processor: Arc<dyn Processor>,
}

/// Outcome of one transaction's run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub tx_hash: String,
    pub matched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Pipeline {
    routes: Vec<Route>,
    retry: RetryPolicy,
    reporter: Arc<dyn ErrorReporter>,
}

impl Pipeline {
    pub fn new(routes: Vec<Route>, retry: RetryPolicy, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            routes,
            retry,
            reporter,
        }
    }

    /// Build every route from configuration
    ///
    /// Filters naming the same processor share one instance.
    ///
    /// # Arguments
    /// * `config` - Validated application configuration
    /// * `store` - Persistence handle passed to every processor
    /// * `reporter` - Failure sink
    ///
    /// # Returns
    /// The pipeline, or the first `ConfigError` found in the filter list
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn Store>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self, ConfigError> {
        let network = config.network()?;
        let codec = Arc::new(AddressCodec::with_default_hasher(network));

        let mut processors: HashMap<String, Arc<dyn Processor>> = HashMap::new();
        let mut routes = Vec::with_capacity(config.filters.len());
        for filter_config in &config.filters {
            let filter = Filter::from_config(filter_config, network)?;
            let processor = match processors.get(&filter_config.processor) {
                Some(processor) => processor.clone(),
                None => {
                    let processor = build_processor(&filter_config.processor, store.clone(), codec.clone())
                        .ok_or_else(|| ConfigError::UnknownProcessor {
                            filter: filter_config.name.clone(),
                            processor: filter_config.processor.clone(),
                        })?;
                    processors.insert(filter_config.processor.clone(), processor.clone());
                    processor
                }
            };
            routes.push(Route { filter, processor });
        }

        info!(%network, routes = routes.len(), processors = processors.len(), "Pipeline built");
        Ok(Self::new(routes, config.retry, reporter))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Routes whose filter matches `tx`. Filter errors are reported and skipped.
    pub fn matching_routes(&self, tx: &Transaction) -> Vec<&Route> {
        let mut matched = Vec::new();
        for route in &self.routes {
            match route.filter.matches(tx) {
                Ok(true) => matched.push(route),
                Ok(false) => {}
                Err(source) => self.reporter.report(
                    &PipelineError::Filter {
                        filter: route.filter.name.clone(),
                        source,
                    },
                    &ReportContext {
                        tx_hash: tx.hash.clone(),
                        stage: Stage::Filtering,
                        component: route.filter.name.clone(),
                        identifier: None,
                    },
                ),
            }
        }
        matched
    }

    /// Run `tx` through filtering and dispatch, returning once every matched processor settled
    pub async fn run(&self, tx: Arc<Transaction>) -> Settlement {
        debug!(tx_hash = %tx.hash, stage = %Stage::Received, "Transaction received");

        debug!(tx_hash = %tx.hash, stage = %Stage::Filtering, routes = self.routes.len());
        let matched = self.matching_routes(&tx);

        debug!(tx_hash = %tx.hash, stage = %Stage::Dispatching, matched = matched.len());
        let tasks = matched.iter().map(|route| {
            let processor = route.processor.clone();
            let tx = tx.clone();
            let policy = self.retry;
            tokio::spawn(async move {
                let label = format!("{}:{}", processor.name(), tx.hash);
                with_retry(&policy, &label, || processor.process(&tx)).await
            })
        });
        let outcomes = join_all(tasks).await;

        let mut settlement = Settlement {
            tx_hash: tx.hash.clone(),
            matched: matched.len(),
            succeeded: 0,
            failed: 0,
        };
        for (route, outcome) in matched.iter().zip(outcomes) {
            let processor = route.processor.name().to_string();
            let failure = match outcome {
                Ok(Ok(_)) => {
                    settlement.succeeded += 1;
                    continue;
                }
                Ok(Err(source)) => PipelineError::Processor {
                    processor: processor.clone(),
                    attempts: self.retry.max_attempts.max(1),
                    source,
                },
                Err(join_error) => PipelineError::TaskAborted {
                    processor: processor.clone(),
                    reason: join_error.to_string(),
                },
            };
            settlement.failed += 1;
            let context = ReportContext {
                tx_hash: tx.hash.clone(),
                stage: Stage::Dispatching,
                component: processor,
                identifier: failure.identifier().map(str::to_string),
            };
            self.reporter.report(&failure, &context);
        }

        debug!(
            tx_hash = %tx.hash,
            stage = %Stage::Settled,
            matched = settlement.matched,
            succeeded = settlement.succeeded,
            failed = settlement.failed,
            "Transaction settled"
        );
        settlement
    }
}
