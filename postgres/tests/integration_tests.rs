//! Integration tests for `PostgresOrderStore` using testcontainers.
//!
//! These tests use a real `PostgreSQL` database to validate the probe, schema and
//! upsert paths, and run the full startup sequence against it.
//!
//! # Requirements
//!
//! Docker must be running to execute these tests. The tests will automatically start a
//! `PostgreSQL` container using testcontainers.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages
#![allow(clippy::unwrap_used)]

use billing_core::order::{DeliveryReceipt, MalformedMessage, OrderId, OrderMessage, OrderRecord, PoisonMessage};
use billing_core::schema::SchemaDescriptor;
use billing_core::store::{OrderStore, StoreError, UpsertOutcome};
use billing_core::ConnectionTarget;
use billing_postgres::{PoolSettings, PostgresOrderStore};
use billing_runtime::{Bootstrap, ConsumerConfig, RetryPolicy, await_ready, ensure_schema, shutdown};
use billing_testing::InMemoryOrderQueue;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Start a Postgres container and return a lazily connected store.
///
/// Returns both the container (to keep it alive) and the store. Readiness is left to
/// the code under test.
async fn setup_postgres_store() -> (ContainerAsync<Postgres>, PostgresOrderStore) {
    let container = Postgres::default()
        .start()
        .await
        .expect("Failed to start postgres container");

    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get postgres port");

    let target = ConnectionTarget::new("127.0.0.1", port, "postgres", "postgres", "postgres");
    let store = PostgresOrderStore::connect_lazy(&target, &PoolSettings::default());

    (container, store)
}

/// Container plus a store whose schema has been applied.
async fn setup_initialized_store() -> (ContainerAsync<Postgres>, PostgresOrderStore) {
    let (container, store) = setup_postgres_store().await;

    await_ready(&store, &RetryPolicy::fixed(60, Duration::from_secs(1)))
        .await
        .expect("Database never became ready");
    ensure_schema(&store, &SchemaDescriptor::billing())
        .await
        .expect("Failed to create schema");

    (container, store)
}

fn order_message(payload: serde_json::Value, offset: i64) -> OrderMessage {
    OrderMessage::new(
        payload.to_string(),
        DeliveryReceipt::new("billing_queue", 0, offset),
    )
}

#[tokio::test]
async fn test_probe_fails_fast_when_unreachable() {
    let target = ConnectionTarget::new("127.0.0.1", 1, "billing", "secret", "billing_db");
    let settings = PoolSettings {
        max_connections: 1,
        acquire_timeout: Duration::from_millis(500),
    };
    let store = PostgresOrderStore::connect_lazy(&target, &settings);

    let err = store.ping().await.expect_err("Nothing listens on port 1");

    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[tokio::test]
async fn test_schema_is_idempotent() {
    let (_container, store) = setup_initialized_store().await;

    // Second and third runs against an initialized database
    ensure_schema(&store, &SchemaDescriptor::billing())
        .await
        .expect("Second schema run failed");
    store
        .ensure_schema(&SchemaDescriptor::billing())
        .await
        .expect("Third schema run failed");

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT table_name::text FROM information_schema.tables WHERE table_schema = 'public' ORDER BY table_name",
    )
    .fetch_all(store.pool())
    .await
    .expect("Failed to list tables");

    let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();
    assert_eq!(names, vec!["orders", "poison_messages"]);
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let (_container, store) = setup_initialized_store().await;
    let message = order_message(json!({"id": "ord-1", "amount": 42}), 0);
    let record = OrderRecord::from_message(&message).expect("Valid order");

    let first = store.upsert_order(&record).await.expect("First upsert failed");
    let second = store.upsert_order(&record).await.expect("Second upsert failed");

    assert_eq!(first, UpsertOutcome::Inserted);
    assert_eq!(second, UpsertOutcome::Duplicate);
    assert_eq!(store.count_orders().await.expect("Count failed"), 1);

    let stored = store
        .fetch_order(&OrderId::new("ord-1".to_string()))
        .await
        .expect("Fetch failed")
        .expect("Order should exist");
    assert_eq!(stored.amount_cents, 4200);
    assert_eq!(stored.contents, json!({"id": "ord-1", "amount": 42}));
    assert_eq!(stored.source, DeliveryReceipt::new("billing_queue", 0, 0));
}

#[tokio::test]
async fn test_duplicate_keeps_first_record() {
    let (_container, store) = setup_initialized_store().await;
    let original = OrderRecord::from_message(&order_message(json!({"id": "ord-2", "amount": 1}), 0))
        .expect("Valid order");
    let replay = OrderRecord::from_message(&order_message(json!({"id": "ord-2", "amount": 9}), 5))
        .expect("Valid order");

    store.upsert_order(&original).await.expect("Upsert failed");
    let outcome = store.upsert_order(&replay).await.expect("Upsert failed");

    assert_eq!(outcome, UpsertOutcome::Duplicate);
    let stored = store
        .fetch_order(&original.order_id)
        .await
        .expect("Fetch failed")
        .expect("Order should exist");
    assert_eq!(stored.amount_cents, 100);
    assert_eq!(stored.source.offset, 0);
}

#[tokio::test]
async fn test_concurrent_upserts_leave_one_record() {
    let (_container, store) = setup_initialized_store().await;
    let record = OrderRecord::from_message(&order_message(json!({"id": "ord-3", "amount": 3}), 0))
        .expect("Valid order");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let record = record.clone();
        tasks.push(tokio::spawn(async move { store.upsert_order(&record).await }));
    }

    let mut inserted = 0;
    for task in tasks {
        if task.await.expect("Task panicked").expect("Upsert failed") == UpsertOutcome::Inserted {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(store.count_orders().await.expect("Count failed"), 1);
}

#[tokio::test]
async fn test_upsert_without_schema_is_transaction_error() {
    let (_container, store) = setup_postgres_store().await;
    await_ready(&store, &RetryPolicy::fixed(60, Duration::from_secs(1)))
        .await
        .expect("Database never became ready");
    let record = OrderRecord::from_message(&order_message(json!({"id": "ord-4", "amount": 1}), 0))
        .expect("Valid order");

    let err = store.upsert_order(&record).await.expect_err("Table does not exist");

    assert!(matches!(err, StoreError::Transaction(_)));
}

#[tokio::test]
async fn test_unstorable_record_is_rejected_not_retried() {
    let (_container, store) = setup_initialized_store().await;
    let base = OrderRecord::from_message(&order_message(json!({"id": "ord-5", "amount": 1}), 0))
        .expect("Valid order");

    // NUL is not allowed in TEXT
    let nul_id = OrderRecord {
        order_id: OrderId::new("ord\0x".to_string()),
        ..base.clone()
    };
    let err = store.upsert_order(&nul_id).await.expect_err("NUL in TEXT");
    assert!(matches!(err, StoreError::Rejected(_)), "{err:?}");
    assert!(!err.is_transient());

    // \u0000 is not allowed in JSONB
    let nul_contents = OrderRecord {
        contents: json!({"id": "ord-5", "note": "a\u{0}b"}),
        ..base
    };
    let err = store.upsert_order(&nul_contents).await.expect_err("NUL in JSONB");
    assert!(matches!(err, StoreError::Rejected(_)), "{err:?}");

    assert_eq!(store.count_orders().await.expect("Count failed"), 0);
}

#[tokio::test]
async fn test_poison_ledger_records_once_per_delivery() {
    let (_container, store) = setup_initialized_store().await;
    let message = OrderMessage::new("not json", DeliveryReceipt::new("billing_queue", 0, 9))
        .with_key("customer-7");
    let poison = PoisonMessage::new(&message, &MalformedMessage::NotAnObject);

    store.record_poison(&poison).await.expect("Record failed");
    store.record_poison(&poison).await.expect("Second record failed");

    let ledger = store.list_poison(10).await.expect("List failed");
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].receipt, poison.receipt);
    assert_eq!(ledger[0].key.as_deref(), Some("customer-7"));
    assert_eq!(ledger[0].payload, b"not json");
}

#[tokio::test]
async fn test_bootstrap_end_to_end() {
    let (_container, store) = setup_postgres_store().await;
    let queue = InMemoryOrderQueue::new("billing_queue");
    queue.publish_json(&json!({"id": "ord-1", "amount": 42}));
    queue.publish_json(&json!({"id": "ord-1", "amount": 42}));
    queue.publish("garbage");
    queue.publish_json(&json!({"id": "ord-2", "amount": 7.5}));
    let (tx, rx) = shutdown::channel();
    queue.shutdown_when_drained(tx);

    let stats = Bootstrap::new(Arc::new(store.clone()), Arc::new(queue.clone()))
        .with_readiness_policy(RetryPolicy::fixed(60, Duration::from_secs(1)))
        .with_consumer_config(ConsumerConfig::immediate(3))
        .start(rx)
        .await
        .expect("Bootstrap failed");

    assert_eq!(stats.stored, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.poisoned, 1);
    assert_eq!(store.count_orders().await.expect("Count failed"), 2);
    assert_eq!(store.list_poison(10).await.expect("List failed").len(), 1);
    assert_eq!(queue.acknowledged().len(), 4);

    store.close().await;
}
