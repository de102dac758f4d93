//! Storage collaborator for billing records.
//!
//! The ingestion path needs exactly three things from the database:
//!
//! - a trivial round-trip to decide whether it is reachable ([`OrderStore::ping`])
//! - idempotent table creation ([`OrderStore::ensure_schema`])
//! - a transactional write keyed on the order identifier ([`OrderStore::upsert_order`])
//!
//! plus a place to park payloads that could never be stored
//! ([`OrderStore::record_poison`]).
//!
//! # Implementations
//!
//! - `PostgresOrderStore` (in `billing-postgres`): production implementation
//! - `InMemoryOrderStore` (in `billing-testing`): fault-injecting test double
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures so the store can be shared as `Arc<dyn OrderStore>`.

use crate::order::{OrderRecord, PoisonMessage};
use crate::schema::SchemaDescriptor;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by an [`OrderStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database could not be reached (connect, pool or I/O failure).
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    /// A statement or commit failed; the transaction was rolled back.
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// The database refused the record's data (invalid value, constraint
    /// violation). Writing the same record again fails the same way.
    #[error("Record rejected: {0}")]
    Rejected(String),

    /// Schema creation failed.
    #[error("Schema error: {0}")]
    Schema(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Connection and transaction failures are transient. Rejected records and
    /// schema failures are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_) | Self::Schema(_))
    }
}

/// Result of an idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new record was committed.
    Inserted,
    /// A record with the same identifier already existed; nothing changed.
    Duplicate,
}

/// Boxed future returned by [`OrderStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Storage backend for billing records.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. Concurrent upserts on distinct identifiers
/// must not interfere, and concurrent upserts on the same identifier must still leave
/// exactly one record.
pub trait OrderStore: Send + Sync {
    /// Execute a trivial round-trip statement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    fn ping(&self) -> StoreFuture<'_, ()>;

    /// Create every table and index in `descriptor` that does not exist yet.
    ///
    /// Safe to call against an initialized database: existing tables and data are
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Schema`] if any statement fails.
    fn ensure_schema<'a>(&'a self, descriptor: &'a SchemaDescriptor) -> StoreFuture<'a, ()>;

    /// Insert `record` inside a single transaction unless its identifier exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] or [`StoreError::Transaction`] for failures
    /// worth retrying, and [`StoreError::Rejected`] when the record itself can never
    /// be written. Nothing was committed in any case.
    fn upsert_order<'a>(&'a self, record: &'a OrderRecord) -> StoreFuture<'a, UpsertOutcome>;

    /// Record a payload that was acknowledged without being stored.
    ///
    /// Recording the same delivery twice keeps a single entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the entry could not be written.
    fn record_poison<'a>(&'a self, poison: &'a PoisonMessage) -> StoreFuture<'a, ()>;
}
