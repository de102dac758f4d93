//! # Billing Runtime
//!
//! The moving parts of billing ingestion, built on the collaborator traits from
//! `billing-core`.
//!
//! ## Core Components
//!
//! - **Readiness Prober** ([`readiness`]): bounded probing of the database at startup
//! - **Schema Initializer** ([`schema`]): idempotent table creation, run once
//! - **Order Consumer Loop** ([`consumer`]): receive, map, upsert, acknowledge
//! - **Bootstrap Orchestrator** ([`bootstrap`]): sequences the three and maps
//!   failures to exit codes
//!
//! Supporting modules: [`retry`] (policies and the retry executor), [`shutdown`]
//! (the stop flag) and [`metrics`] (Prometheus counters).
//!
//! ## Example
//!
//! ```rust,no_run
//! use billing_runtime::{Bootstrap, RetryPolicy, shutdown};
//! # use std::sync::Arc;
//! # use billing_core::{OrderQueue, OrderStore};
//!
//! # async fn example(store: Arc<dyn OrderStore>, queue: Arc<dyn OrderQueue>) {
//! let (stop, signal) = shutdown::channel();
//!
//! let result = Bootstrap::new(store, queue)
//!     .with_readiness_policy(RetryPolicy::readiness())
//!     .start(signal)
//!     .await;
//! # }
//! ```

pub mod bootstrap;
pub mod consumer;
pub mod metrics;
pub mod readiness;
pub mod retry;
pub mod schema;
pub mod shutdown;

pub use bootstrap::{Bootstrap, BootstrapError};
pub use consumer::{ConsumerConfig, ConsumerError, ConsumerStats, Disposition, OrderConsumer};
pub use readiness::{Unready, await_ready};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use schema::{SchemaError, ensure_schema};
