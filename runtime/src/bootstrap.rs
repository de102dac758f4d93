//! Startup sequencing: readiness, then schema, then the consumer loop.
//!
//! Each stage runs only if the previous one succeeded. The consumer never starts
//! against an unreachable or uninitialized database; instead the orchestrator
//! returns a [`BootstrapError`] whose [`exit_code`](BootstrapError::exit_code) the
//! binary hands to the operating system.

use crate::consumer::{ConsumerConfig, ConsumerError, ConsumerStats, OrderConsumer};
use crate::readiness::{Unready, await_ready, worst_case_wait};
use crate::retry::RetryPolicy;
use crate::schema::{SchemaError, ensure_schema};
use crate::shutdown;
use billing_core::config::ConfigError;
use billing_core::queue::OrderQueue;
use billing_core::schema::SchemaDescriptor;
use billing_core::store::OrderStore;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Fatal startup or runtime failures, each with its own exit status.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Configuration was missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The database never became reachable.
    #[error(transparent)]
    Unready(#[from] Unready),

    /// The schema could not be created.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The consumer lost the queue for good.
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

impl BootstrapError {
    /// Process exit status for this failure (sysexits.h values).
    ///
    /// | Failure | Code |
    /// |---------|------|
    /// | Configuration | 78 (`EX_CONFIG`) |
    /// | Database unready | 69 (`EX_UNAVAILABLE`) |
    /// | Schema | 70 (`EX_SOFTWARE`) |
    /// | Queue lost | 74 (`EX_IOERR`) |
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 78,
            Self::Unready(_) => 69,
            Self::Schema(_) => 70,
            Self::Consumer(_) => 74,
        }
    }
}

/// Owns the collaborators and runs the startup sequence.
///
/// # Example
///
/// ```rust,no_run
/// use billing_runtime::bootstrap::Bootstrap;
/// use billing_runtime::shutdown;
/// # use std::sync::Arc;
/// # use billing_core::{OrderQueue, OrderStore};
///
/// # async fn example(store: Arc<dyn OrderStore>, queue: Arc<dyn OrderQueue>) {
/// let (_stop, shutdown) = shutdown::channel();
///
/// match Bootstrap::new(store, queue).start(shutdown).await {
///     Ok(stats) => println!("stopped after {} orders", stats.stored),
///     Err(error) => std::process::exit(i32::from(error.exit_code())),
/// }
/// # }
/// ```
pub struct Bootstrap {
    store: Arc<dyn OrderStore>,
    queue: Arc<dyn OrderQueue>,
    readiness: RetryPolicy,
    schema: SchemaDescriptor,
    consumer: ConsumerConfig,
}

impl Bootstrap {
    /// Create an orchestrator with the readiness policy, billing schema and
    /// consumer timing defaults.
    #[must_use]
    pub fn new(store: Arc<dyn OrderStore>, queue: Arc<dyn OrderQueue>) -> Self {
        Self {
            store,
            queue,
            readiness: RetryPolicy::readiness(),
            schema: SchemaDescriptor::billing(),
            consumer: ConsumerConfig::default(),
        }
    }

    /// Override the readiness policy.
    #[must_use]
    pub fn with_readiness_policy(mut self, policy: RetryPolicy) -> Self {
        self.readiness = policy;
        self
    }

    /// Override the schema.
    #[must_use]
    pub fn with_schema(mut self, schema: SchemaDescriptor) -> Self {
        self.schema = schema;
        self
    }

    /// Override the consumer timing.
    #[must_use]
    pub fn with_consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer = config;
        self
    }

    /// Probe, initialize, then consume until shutdown.
    ///
    /// A shutdown request during the readiness phase returns early with empty
    /// stats; schema initialization is short and always runs to completion.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Unready`] or [`BootstrapError::Schema`] without
    /// starting the consumer, or [`BootstrapError::Consumer`] if the queue is lost.
    pub async fn start(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats, BootstrapError> {
        tracing::info!(
            max_attempts = self.readiness.max_attempts,
            max_sleep_secs = self.readiness.total_wait().as_secs(),
            max_wait_secs = worst_case_wait(&self.readiness).as_secs(),
            "Waiting for database"
        );

        let mut early_stop = shutdown.clone();
        tokio::select! {
            biased;
            () = shutdown::requested(&mut early_stop) => {
                tracing::info!("Shutdown requested before the database became ready");
                return Ok(ConsumerStats::default());
            }
            ready = await_ready(self.store.as_ref(), &self.readiness) => ready?,
        }

        ensure_schema(self.store.as_ref(), &self.schema).await?;

        let stats = OrderConsumer::new(self.queue, self.store, shutdown)
            .with_config(self.consumer)
            .run()
            .await?;

        Ok(stats)
    }
}
