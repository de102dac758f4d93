//! Billing ingestion service.
//!
//! Wires the Postgres order store and the Redpanda order queue into the startup
//! sequence from `billing-runtime`. The `billing-app` binary is a thin wrapper over
//! [`run`].

pub mod config;
pub mod lifecycle;

use billing_postgres::PostgresOrderStore;
use billing_runtime::metrics::MetricsServer;
use billing_runtime::{Bootstrap, BootstrapError, ConsumerStats, shutdown};
use config::AppConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// Load configuration, start the service and run until shutdown or a fatal error.
///
/// # Errors
///
/// Returns [`BootstrapError`]; its exit code is what the process should exit with.
pub async fn run() -> Result<ConsumerStats, BootstrapError> {
    let config = AppConfig::from_env()?;
    info!(
        database = %config.database.target,
        brokers = %config.queue.brokers,
        topic = %config.queue.topic,
        consumer_group = %config.queue.consumer_group,
        readiness_retries = config.readiness.retries(),
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        let mut server = MetricsServer::new(addr);
        if let Err(e) = server.start() {
            warn!(error = %e, "Metrics disabled");
        }
    }

    let queue = config.queue.build()?;
    let store = PostgresOrderStore::connect_lazy(&config.database.target, &config.database.pool);

    let (stop, signal) = shutdown::channel();
    let signals = tokio::spawn(lifecycle::stop_on(lifecycle::shutdown_signal(), stop));

    let result = Bootstrap::new(Arc::new(store.clone()), Arc::new(queue))
        .with_readiness_policy(config.readiness)
        .with_consumer_config(config.consumer)
        .start(signal)
        .await;

    signals.abort();
    store.close().await;

    result
}
