//! In-memory order store with fault injection.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use billing_core::order::{OrderId, OrderRecord, PoisonMessage};
use billing_core::schema::SchemaDescriptor;
use billing_core::store::{OrderStore, StoreError, StoreFuture, UpsertOutcome};
use std::collections::{BTreeSet, HashMap};
use std::future;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct StoreState {
    orders: HashMap<OrderId, OrderRecord>,
    poison: Vec<PoisonMessage>,
    tables: BTreeSet<String>,
    pings: usize,
    schema_calls: usize,
    upsert_calls: usize,
    failing_pings: usize,
    hanging_pings: usize,
    failing_upserts: usize,
    rejected_upserts: usize,
    schema_failure: Option<String>,
    poison_failure: bool,
}

/// HashMap-backed [`OrderStore`] for fast, deterministic tests.
///
/// Failures are scripted up front: `fail_next_pings(3)` makes the next three probes
/// fail, after which the store behaves normally again.
///
/// # Example
///
/// ```
/// use billing_testing::InMemoryOrderStore;
/// use billing_core::store::OrderStore;
///
/// # async fn example() {
/// let store = InMemoryOrderStore::new();
/// store.fail_next_pings(1);
///
/// assert!(store.ping().await.is_err());
/// assert!(store.ping().await.is_ok());
/// assert_eq!(store.ping_count(), 2);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryOrderStore {
    /// Create an empty, healthy store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` probes fail with [`StoreError::Unavailable`].
    pub fn fail_next_pings(&self, n: usize) {
        self.state.write().unwrap().failing_pings = n;
    }

    /// Make the next `n` probes never complete, like a connect to an unroutable host.
    pub fn hang_next_pings(&self, n: usize) {
        self.state.write().unwrap().hanging_pings = n;
    }

    /// Make the next `n` upserts fail with [`StoreError::Transaction`].
    pub fn fail_next_upserts(&self, n: usize) {
        self.state.write().unwrap().failing_upserts = n;
    }

    /// Make the next `n` upserts fail with [`StoreError::Rejected`].
    pub fn reject_next_upserts(&self, n: usize) {
        self.state.write().unwrap().rejected_upserts = n;
    }

    /// Make every schema call fail with [`StoreError::Schema`].
    pub fn fail_schema(&self, reason: impl Into<String>) {
        self.state.write().unwrap().schema_failure = Some(reason.into());
    }

    /// Make poison recording fail (or succeed again).
    pub fn fail_poison_records(&self, fail: bool) {
        self.state.write().unwrap().poison_failure = fail;
    }

    /// Number of probes received, failed ones included.
    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.state.read().unwrap().pings
    }

    /// Number of `ensure_schema` calls.
    #[must_use]
    pub fn schema_calls(&self) -> usize {
        self.state.read().unwrap().schema_calls
    }

    /// Number of upserts attempted, failed ones included.
    #[must_use]
    pub fn upsert_calls(&self) -> usize {
        self.state.read().unwrap().upsert_calls
    }

    /// Tables created so far, sorted by name.
    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        self.state.read().unwrap().tables.iter().cloned().collect()
    }

    /// Number of committed orders.
    #[must_use]
    pub fn count_orders(&self) -> usize {
        self.state.read().unwrap().orders.len()
    }

    /// Look up a committed order.
    #[must_use]
    pub fn fetch_order(&self, id: &OrderId) -> Option<OrderRecord> {
        self.state.read().unwrap().orders.get(id).cloned()
    }

    /// Recorded poison messages, oldest first.
    #[must_use]
    pub fn poison_messages(&self) -> Vec<PoisonMessage> {
        self.state.read().unwrap().poison.clone()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn ping(&self) -> StoreFuture<'_, ()> {
        let mut state = self.state.write().unwrap();
        state.pings += 1;

        if state.hanging_pings > 0 {
            state.hanging_pings -= 1;
            return Box::pin(future::pending());
        }

        let result = if state.failing_pings > 0 {
            state.failing_pings -= 1;
            Err(StoreError::Unavailable(format!(
                "connection refused (probe {})",
                state.pings
            )))
        } else {
            Ok(())
        };

        Box::pin(future::ready(result))
    }

    fn ensure_schema<'a>(&'a self, descriptor: &'a SchemaDescriptor) -> StoreFuture<'a, ()> {
        let mut state = self.state.write().unwrap();
        state.schema_calls += 1;

        let result = if let Some(reason) = state.schema_failure.clone() {
            Err(StoreError::Schema(reason))
        } else {
            for table in descriptor.tables() {
                state.tables.insert(table.name().to_string());
            }
            Ok(())
        };

        Box::pin(future::ready(result))
    }

    fn upsert_order<'a>(&'a self, record: &'a OrderRecord) -> StoreFuture<'a, UpsertOutcome> {
        let mut state = self.state.write().unwrap();
        state.upsert_calls += 1;

        let result = if state.failing_upserts > 0 {
            state.failing_upserts -= 1;
            Err(StoreError::Transaction("injected transaction failure".to_string()))
        } else if state.rejected_upserts > 0 {
            state.rejected_upserts -= 1;
            Err(StoreError::Rejected("injected invalid byte sequence".to_string()))
        } else if state.orders.contains_key(&record.order_id) {
            Ok(UpsertOutcome::Duplicate)
        } else {
            state.orders.insert(record.order_id.clone(), record.clone());
            Ok(UpsertOutcome::Inserted)
        };

        Box::pin(future::ready(result))
    }

    fn record_poison<'a>(&'a self, poison: &'a PoisonMessage) -> StoreFuture<'a, ()> {
        let mut state = self.state.write().unwrap();

        let result = if state.poison_failure {
            Err(StoreError::Unavailable("injected poison ledger failure".to_string()))
        } else {
            if !state.poison.iter().any(|p| p.receipt == poison.receipt) {
                state.poison.push(poison.clone());
            }
            Ok(())
        };

        Box::pin(future::ready(result))
    }
}
