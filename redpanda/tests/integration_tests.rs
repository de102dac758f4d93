//! Integration tests for [`RedpandaOrderQueue`] with a real Kafka/Redpanda instance.
//!
//! These tests use testcontainers to spin up a real Kafka instance and validate:
//! - Receive after produce
//! - Release seeks back and flags the redelivery
//! - Unacknowledged messages come back to the next group member
//! - Acknowledged messages do not
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//! - Can be flaky due to Kafka's distributed nature and timing
//!
//! To run explicitly:
//! ```bash
//! cargo test -p billing-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use billing_core::order::OrderMessage;
use billing_core::queue::{OrderQueue, OrderSubscription};
use billing_redpanda::RedpandaOrderQueue;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde_json::json;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const TOPIC: &str = "billing_queue";

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let container = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let port = container
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get Kafka port");

    (container, format!("127.0.0.1:{port}"))
}

fn producer(brokers: &str) -> FutureProducer {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()
        .expect("Failed to create producer")
}

/// Produce one order, retrying while the broker and topic come up.
async fn produce(producer: &FutureProducer, key: &str, payload: &str) {
    for attempt in 1..=60 {
        let record = FutureRecord::to(TOPIC).key(key).payload(payload);
        if producer.send(record, Duration::from_secs(5)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Kafka never accepted a message");
    }
}

fn queue(brokers: &str, group: &str) -> RedpandaOrderQueue {
    RedpandaOrderQueue::builder()
        .brokers(brokers)
        .topic(TOPIC)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to build queue")
}

async fn receive(subscription: &mut Box<dyn OrderSubscription>) -> OrderMessage {
    tokio::time::timeout(Duration::from_secs(30), subscription.receive())
        .await
        .expect("Timed out waiting for a message")
        .expect("Receive failed")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_receive_and_release_redelivers() {
    let (_container, brokers) = start_kafka().await;
    let producer = producer(&brokers);
    produce(&producer, "customer-1", &json!({"id": "ord-1", "amount": 10}).to_string()).await;

    let queue = queue(&brokers, "billing-release");
    let mut subscription = queue.subscribe().await.expect("Subscribe failed");

    let first = receive(&mut subscription).await;
    assert_eq!(first.key.as_deref(), Some("customer-1"));
    assert!(!first.redelivered);

    subscription.release(&first.receipt).await.expect("Release failed");

    let again = receive(&mut subscription).await;
    assert_eq!(again.receipt, first.receipt);
    assert_eq!(again.payload, first.payload);
    assert!(again.redelivered);

    subscription.acknowledge(&again.receipt).await.expect("Acknowledge failed");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unacknowledged_message_returns_to_group() {
    let (_container, brokers) = start_kafka().await;
    let producer = producer(&brokers);
    produce(&producer, "customer-2", &json!({"id": "ord-2", "amount": 1}).to_string()).await;
    produce(&producer, "customer-2", &json!({"id": "ord-3", "amount": 2}).to_string()).await;

    let queue = queue(&brokers, "billing-restart");

    let mut subscription = queue.subscribe().await.expect("Subscribe failed");
    let first = receive(&mut subscription).await;
    subscription.acknowledge(&first.receipt).await.expect("Acknowledge failed");
    let second = receive(&mut subscription).await;
    // Crash before committing the second message
    drop(subscription);

    let mut replacement = queue.subscribe().await.expect("Resubscribe failed");
    let replayed = receive(&mut replacement).await;

    assert_eq!(replayed.receipt, second.receipt);
    assert_eq!(replayed.payload, second.payload);
}
