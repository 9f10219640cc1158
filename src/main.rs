//! CKB Event Indexer
//!
//! Wires the configured pipeline between the Redis transaction bus and the Redis store,
//! then runs until the bus gives up or ctrl-c is received. Accepted transactions are
//! always drained before exit.

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use ckb_event_indexer::bus::BusSubscriber;
use ckb_event_indexer::config::{resolve_config_path, AppConfig};
use ckb_event_indexer::{IngestionQueue, Pipeline, RedisStore, Store, TracingReporter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = resolve_config_path(std::env::args().nth(1));
    let config = AppConfig::load(&config_path)?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level()?)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(path = %config_path, network = %config.network()?, filters = config.filters.len(), "Configuration loaded");

    let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&config.redis).await?);
    let pipeline = Pipeline::from_config(&config, store, Arc::new(TracingReporter))?;
    let queue = IngestionQueue::start(Arc::new(pipeline));

    let mut bus_subscriber = BusSubscriber::new(config.redis.url.clone(), config.bus.clone());
    let bus_queue = queue.handle();
    let mut bus = tokio::spawn(async move { bus_subscriber.run(bus_queue).await });

    let bus_finished = tokio::select! {
        result = &mut bus => {
            match result {
                Ok(Ok(())) => info!("Bus subscription finished"),
                Ok(Err(e)) => error!(error = %e, "Bus subscription failed"),
                Err(e) => error!(error = %e, "Bus task aborted"),
            }
            true
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutdown signal received, draining queue");
            false
        }
    };

    if !bus_finished {
        bus.abort();
        // the aborted task drops its queue handle
        let _ = bus.await;
    }

    let report = queue.shutdown().await?;
    info!(
        transactions = report.transactions,
        failed_invocations = report.failed_invocations,
        "Indexer stopped"
    );
    Ok(())
}
