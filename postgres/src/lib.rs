//! `PostgreSQL` order store for billing ingestion.
//!
//! Implements the `OrderStore` trait from `billing-core` on top of a sqlx
//! connection pool:
//!
//! - Readiness probe via `SELECT 1`
//! - Schema creation from a `SchemaDescriptor`, serialized across processes with a
//!   transaction-scoped advisory lock
//! - Idempotent, transactional order upsert (`ON CONFLICT (order_id) DO NOTHING`)
//! - Poison-message ledger keyed on the delivery position
//!
//! # Example
//!
//! ```no_run
//! use billing_core::ConnectionTarget;
//! use billing_postgres::{PoolSettings, PostgresOrderStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let target = ConnectionTarget::from_env()?;
//! let store = PostgresOrderStore::connect_lazy(&target, &PoolSettings::default());
//!
//! println!("{} orders stored", store.count_orders().await?);
//! # Ok(())
//! # }
//! ```

use billing_core::connection::ConnectionTarget;
use billing_core::order::{DeliveryReceipt, OrderId, OrderRecord, PoisonMessage};
use billing_core::schema::SchemaDescriptor;
use billing_core::store::{OrderStore, StoreError, StoreFuture, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Advisory lock held while applying the schema, so concurrent replicas starting
/// at the same time do not race on `CREATE TABLE`.
const SCHEMA_LOCK_KEY: i64 = 0x6269_6c6c_696e_67;

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum pooled connections
    pub max_connections: u32,
    /// How long to wait for a free (or new) connection before failing
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// `PostgreSQL`-backed [`OrderStore`].
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone, Debug)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Build a store whose pool connects on first use.
    ///
    /// No connection is attempted here, so this succeeds while the database is still
    /// starting; the readiness probe is what waits for it.
    #[must_use]
    pub fn connect_lazy(target: &ConnectionTarget, settings: &PoolSettings) -> Self {
        let options = PgConnectOptions::new()
            .host(target.host())
            .port(target.port())
            .username(target.user())
            .password(target.password())
            .database(target.database());

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_lazy_with(options);

        tracing::debug!(target = %target, "Created lazy connection pool");
        Self { pool }
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Load one stored order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub async fn fetch_order(&self, id: &OrderId) -> Result<Option<OrderRecord>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT order_id, amount_cents, payload, source_topic, source_partition,
                   source_offset, received_at
            FROM orders
            WHERE order_id = $1
            ",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.as_ref().map(row_to_order).transpose()
    }

    /// Number of stored orders.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_orders(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(count)
    }

    /// Most recent poison-ledger entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub async fn list_poison(&self, limit: usize) -> Result<Vec<PoisonMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r"
            SELECT source_topic, source_partition, source_offset, message_key,
                   payload, error_message, received_at
            FROM (
                SELECT * FROM poison_messages ORDER BY id DESC LIMIT $1
            ) recent
            ORDER BY id ASC
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter().map(row_to_poison).collect()
    }

    async fn probe(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn apply_schema(&self, descriptor: &SchemaDescriptor) -> Result<(), StoreError> {
        let schema_error = |e: sqlx::Error| StoreError::Schema(e.to_string());

        let mut tx = self.pool.begin().await.map_err(schema_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(schema_error)?;

        for statement in descriptor.statements() {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(schema_error)?;
        }

        tx.commit().await.map_err(schema_error)?;
        Ok(())
    }

    async fn insert_order(&self, record: &OrderRecord) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let result = sqlx::query(
            r"
            INSERT INTO orders (
                order_id, amount_cents, payload, source_topic, source_partition,
                source_offset, received_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id) DO NOTHING
            ",
        )
        .bind(record.order_id.as_str())
        .bind(record.amount_cents)
        .bind(Json(&record.contents))
        .bind(&record.source.topic)
        .bind(record.source.partition)
        .bind(record.source.offset)
        .bind(record.received_at)
        .execute(&mut *tx)
        .await;

        let inserted = match result {
            Ok(done) => done.rows_affected() == 1,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::debug!(error = %rollback, "Rollback after failed insert also failed");
                }
                return Err(classify(e));
            }
        };

        tx.commit().await.map_err(classify)?;

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Duplicate
        })
    }

    async fn insert_poison(&self, poison: &PoisonMessage) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO poison_messages (
                source_topic, source_partition, source_offset, message_key,
                payload, error_message, received_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_topic, source_partition, source_offset) DO NOTHING
            ",
        )
        .bind(&poison.receipt.topic)
        .bind(poison.receipt.partition)
        .bind(poison.receipt.offset)
        .bind(poison.key.as_deref())
        .bind(&poison.payload)
        .bind(&poison.error)
        .bind(poison.received_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }
}

impl OrderStore for PostgresOrderStore {
    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(self.probe())
    }

    fn ensure_schema<'a>(&'a self, descriptor: &'a SchemaDescriptor) -> StoreFuture<'a, ()> {
        Box::pin(self.apply_schema(descriptor))
    }

    fn upsert_order<'a>(&'a self, record: &'a OrderRecord) -> StoreFuture<'a, UpsertOutcome> {
        Box::pin(self.insert_order(record))
    }

    fn record_poison<'a>(&'a self, poison: &'a PoisonMessage) -> StoreFuture<'a, ()> {
        Box::pin(self.insert_poison(poison))
    }
}

/// Split sqlx errors into "database unreachable", "data refused" and "statement
/// failed".
fn classify(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(error.to_string()),
        sqlx::Error::Database(ref db) if db.code().is_some_and(|code| is_permanent_sqlstate(&code)) => {
            StoreError::Rejected(error.to_string())
        }
        other => StoreError::Transaction(other.to_string()),
    }
}

/// SQLSTATE class 22 (data exception) or 23 (integrity constraint violation).
///
/// The order insert resolves identifier conflicts itself, so any class 23 error that
/// reaches here comes from the record's own data.
fn is_permanent_sqlstate(code: &str) -> bool {
    code.starts_with("22") || code.starts_with("23")
}

fn decode(error: sqlx::Error) -> StoreError {
    StoreError::Transaction(format!("Failed to decode row: {error}"))
}

fn row_to_receipt(row: &PgRow) -> Result<DeliveryReceipt, StoreError> {
    Ok(DeliveryReceipt::new(
        row.try_get::<String, _>("source_topic").map_err(decode)?,
        row.try_get::<i32, _>("source_partition").map_err(decode)?,
        row.try_get::<i64, _>("source_offset").map_err(decode)?,
    ))
}

fn row_to_order(row: &PgRow) -> Result<OrderRecord, StoreError> {
    let Json(contents): Json<Value> = row.try_get("payload").map_err(decode)?;

    Ok(OrderRecord {
        order_id: OrderId::new(row.try_get("order_id").map_err(decode)?),
        amount_cents: row.try_get("amount_cents").map_err(decode)?,
        contents,
        source: row_to_receipt(row)?,
        received_at: row.try_get::<DateTime<Utc>, _>("received_at").map_err(decode)?,
    })
}

fn row_to_poison(row: &PgRow) -> Result<PoisonMessage, StoreError> {
    Ok(PoisonMessage {
        receipt: row_to_receipt(row)?,
        key: row.try_get("message_key").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        error: row.try_get("error_message").map_err(decode)?,
        received_at: row.try_get::<DateTime<Utc>, _>("received_at").map_err(decode)?,
    })
}
