//! The order consumer loop.
//!
//! Pulls one message at a time from an [`OrderQueue`] subscription and turns it
//! into a committed [`OrderRecord`]:
//!
//! 1. Receive (raced against shutdown)
//! 2. Map the payload; a malformed payload is recorded as poison and acknowledged
//! 3. Upsert inside a single transaction, keyed on the order identifier
//! 4. Acknowledge only after the commit; on failure release for redelivery and back off
//!
//! Handling a received message is never raced against shutdown, so a stop request
//! lets the in-flight transaction and its acknowledgement complete.
//!
//! # Failure Handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Malformed payload | Poison ledger entry (best effort), acknowledged, never retried |
//! | Store error | Released, redelivered after an exponential delay |
//! | Receive/acknowledge error | Subscription reopened with retry |
//! | Resubscribe budget exhausted | [`ConsumerError::QueueConnectionLost`] |

use crate::metrics::IngestMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::shutdown;
use billing_core::order::{OrderMessage, OrderRecord, PoisonMessage};
use billing_core::queue::{OrderQueue, OrderSubscription, QueueError};
use billing_core::store::{OrderStore, UpsertOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Timing for the consumer's two retry paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Attempts and backoff for reopening a lost subscription
    pub resubscribe: RetryPolicy,
    /// Delay schedule after consecutive persistence failures (attempt budget unused)
    pub redelivery: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            resubscribe: RetryPolicy::builder()
                .max_attempts(10)
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(30))
                .multiplier(2.0)
                .build(),
            redelivery: RetryPolicy::builder()
                .max_attempts(usize::MAX)
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(30))
                .multiplier(2.0)
                .build(),
        }
    }
}

impl ConsumerConfig {
    /// Set the number of attempts for reopening a subscription.
    #[must_use]
    pub const fn with_resubscribe_attempts(mut self, attempts: usize) -> Self {
        self.resubscribe.max_attempts = attempts;
        self
    }

    /// Both paths retry without sleeping. Intended for tests.
    #[must_use]
    pub const fn immediate(resubscribe_attempts: usize) -> Self {
        Self {
            resubscribe: RetryPolicy::immediate(resubscribe_attempts),
            redelivery: RetryPolicy::immediate(usize::MAX),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Committed as a new record and acknowledged.
    Stored,
    /// The order already existed; acknowledged without changes.
    Duplicate,
    /// The payload could not be mapped, or the store refused it for good;
    /// acknowledged and recorded as poison.
    Poisoned,
    /// Persistence failed; released for redelivery.
    Deferred,
}

/// Counters for one run of the consumer loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries received, redeliveries included
    pub received: u64,
    /// New records committed
    pub stored: u64,
    /// Deliveries for orders that already existed
    pub duplicates: u64,
    /// Malformed deliveries acknowledged without storage
    pub poisoned: u64,
    /// Deliveries released after a persistence failure
    pub deferred: u64,
    /// Subscriptions reopened after a connection loss
    pub resubscriptions: u64,
}

/// Fatal consumer failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The queue stayed unreachable for the whole resubscribe budget.
    #[error("Queue connection lost after {attempts} subscription attempts: {reason}")]
    QueueConnectionLost {
        /// Subscription attempts made
        attempts: usize,
        /// Error from the final attempt
        #[source]
        reason: QueueError,
    },
}

/// Sequential consumer moving orders from a queue into a store.
///
/// # Example
///
/// ```rust,no_run
/// use billing_runtime::consumer::OrderConsumer;
/// use billing_runtime::shutdown;
/// # use std::sync::Arc;
/// # use billing_core::{OrderQueue, OrderStore};
///
/// # async fn example(queue: Arc<dyn OrderQueue>, store: Arc<dyn OrderStore>) {
/// let (stop, shutdown) = shutdown::channel();
/// let consumer = OrderConsumer::new(queue, store, shutdown);
///
/// let handle = tokio::spawn(consumer.run());
/// // ... later
/// stop.send_replace(true);
/// let stats = handle.await;
/// # }
/// ```
pub struct OrderConsumer {
    queue: Arc<dyn OrderQueue>,
    store: Arc<dyn OrderStore>,
    shutdown: watch::Receiver<bool>,
    config: ConsumerConfig,
    stats: ConsumerStats,
    consecutive_failures: usize,
}

impl OrderConsumer {
    /// Create a consumer with the default [`ConsumerConfig`].
    #[must_use]
    pub fn new(
        queue: Arc<dyn OrderQueue>,
        store: Arc<dyn OrderStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            shutdown,
            config: ConsumerConfig::default(),
            stats: ConsumerStats::default(),
            consecutive_failures: 0,
        }
    }

    /// Replace the retry timing.
    #[must_use]
    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Run until shutdown is requested or the queue is lost for good.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::QueueConnectionLost`] if a subscription cannot be
    /// (re)opened within the resubscribe budget.
    pub async fn run(mut self) -> Result<ConsumerStats, ConsumerError> {
        let Some(mut subscription) = self.open_subscription().await? else {
            return Ok(self.finish());
        };
        tracing::info!("Order consumer subscribed");

        loop {
            let received = tokio::select! {
                biased;
                () = shutdown::requested(&mut self.shutdown) => break,
                received = subscription.receive() => received,
            };

            let outcome = match received {
                Ok(message) => self.handle(subscription.as_mut(), message).await,
                Err(error) => Err(error),
            };

            match outcome {
                Ok(Disposition::Deferred) => self.back_off().await,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "Queue connection lost, reopening subscription");
                    drop(subscription);

                    let Some(reopened) = self.open_subscription().await? else {
                        break;
                    };
                    subscription = reopened;
                    self.stats.resubscriptions += 1;
                    IngestMetrics::record_resubscription();
                    tracing::info!(
                        resubscriptions = self.stats.resubscriptions,
                        "Order consumer resubscribed"
                    );
                }
            }
        }

        Ok(self.finish())
    }

    /// Process one received message to completion.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the acknowledgement or release was rejected; the
    /// message may then be delivered again.
    pub async fn handle(
        &mut self,
        subscription: &mut dyn OrderSubscription,
        message: OrderMessage,
    ) -> Result<Disposition, QueueError> {
        self.stats.received += 1;
        let receipt = &message.receipt;

        let record = match OrderRecord::from_message(&message) {
            Ok(record) => record,
            Err(error) => return self.poison(subscription, &message, &error.to_string()).await,
        };

        let started = Instant::now();
        match self.store.upsert_order(&record).await {
            Ok(UpsertOutcome::Inserted) => {
                subscription.acknowledge(receipt).await?;

                self.consecutive_failures = 0;
                self.stats.stored += 1;
                IngestMetrics::record_stored(started.elapsed());
                tracing::debug!(order_id = %record.order_id, receipt = %receipt, "Order stored");
                Ok(Disposition::Stored)
            }
            Ok(UpsertOutcome::Duplicate) => {
                subscription.acknowledge(receipt).await?;

                self.consecutive_failures = 0;
                self.stats.duplicates += 1;
                IngestMetrics::record_duplicate(started.elapsed());
                tracing::debug!(
                    order_id = %record.order_id,
                    redelivered = message.redelivered,
                    "Order already stored, acknowledged duplicate"
                );
                Ok(Disposition::Duplicate)
            }
            Err(error) if !error.is_transient() => {
                tracing::warn!(
                    order_id = %record.order_id,
                    receipt = %receipt,
                    error = %error,
                    "Order refused by the store, treating as poison"
                );
                self.poison(subscription, &message, &error.to_string()).await
            }
            Err(error) => {
                tracing::warn!(
                    order_id = %record.order_id,
                    receipt = %receipt,
                    error = %error,
                    "Order not persisted, releasing for redelivery"
                );
                subscription.release(receipt).await?;

                self.consecutive_failures += 1;
                self.stats.deferred += 1;
                IngestMetrics::record_deferred();
                Ok(Disposition::Deferred)
            }
        }
    }

    /// Record `message` in the poison ledger (best effort) and acknowledge it.
    async fn poison(
        &mut self,
        subscription: &mut dyn OrderSubscription,
        message: &OrderMessage,
        reason: &str,
    ) -> Result<Disposition, QueueError> {
        let receipt = &message.receipt;
        let poison = PoisonMessage::new(message, &reason);
        if let Err(store_error) = self.store.record_poison(&poison).await {
            tracing::warn!(
                receipt = %receipt,
                error = %store_error,
                "Failed to record poison message"
            );
        }

        subscription.acknowledge(receipt).await?;

        self.consecutive_failures = 0;
        self.stats.poisoned += 1;
        IngestMetrics::record_poisoned();
        tracing::warn!(
            topic = %receipt.topic,
            partition = receipt.partition,
            offset = receipt.offset,
            error = %reason,
            "Poison message acknowledged without storage"
        );
        Ok(Disposition::Poisoned)
    }

    async fn back_off(&mut self) {
        let delay = self
            .config
            .redelivery
            .delay_for_attempt(self.consecutive_failures);

        tokio::select! {
            biased;
            () = shutdown::requested(&mut self.shutdown) => {}
            () = tokio::time::sleep(delay) => {}
        }
    }

    /// Open a subscription with retry. `Ok(None)` means shutdown came first.
    async fn open_subscription(
        &self,
    ) -> Result<Option<Box<dyn OrderSubscription>>, ConsumerError> {
        let mut shutdown = self.shutdown.clone();

        tokio::select! {
            biased;
            () = shutdown::requested(&mut shutdown) => Ok(None),
            opened = self.subscribe_with_retry() => opened.map(Some),
        }
    }

    async fn subscribe_with_retry(&self) -> Result<Box<dyn OrderSubscription>, ConsumerError> {
        let mut attempts = 0_usize;

        let opened = retry_with_backoff(&self.config.resubscribe, "queue subscribe", || {
            attempts += 1;
            self.queue.subscribe()
        })
        .await;

        opened.map_err(|reason| ConsumerError::QueueConnectionLost { attempts, reason })
    }

    fn finish(&self) -> ConsumerStats {
        tracing::info!(
            received = self.stats.received,
            stored = self.stats.stored,
            duplicates = self.stats.duplicates,
            poisoned = self.stats.poisoned,
            deferred = self.stats.deferred,
            "Order consumer stopped"
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use billing_core::order::OrderId;
    use billing_testing::{InMemoryOrderQueue, InMemoryOrderStore};
    use proptest::prelude::*;
    use serde_json::json;

    struct Harness {
        queue: InMemoryOrderQueue,
        store: InMemoryOrderStore,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                queue: InMemoryOrderQueue::new("billing_queue"),
                store: InMemoryOrderStore::new(),
            }
        }

        /// Run the consumer until every published message is acknowledged.
        async fn drain(&self, config: ConsumerConfig) -> Result<ConsumerStats, ConsumerError> {
            let (tx, rx) = shutdown::channel();
            self.queue.shutdown_when_drained(tx);
            self.consumer(rx, config).run().await
        }

        fn consumer(&self, shutdown: watch::Receiver<bool>, config: ConsumerConfig) -> OrderConsumer {
            OrderConsumer::new(
                Arc::new(self.queue.clone()),
                Arc::new(self.store.clone()),
                shutdown,
            )
            .with_config(config)
        }
    }

    fn order_id(id: &str) -> OrderId {
        OrderId::new(id.to_string())
    }

    #[tokio::test]
    async fn stores_order_and_acknowledges() {
        let h = Harness::new();
        let receipt = h.queue.publish_json(&json!({"id": "ord-1", "amount": 42}));

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.stored, 1);
        assert_eq!(h.queue.acknowledged(), vec![receipt]);
        let record = h.store.fetch_order(&order_id("ord-1")).unwrap();
        assert_eq!(record.amount_cents, 4200);
    }

    #[tokio::test]
    async fn redelivered_message_leaves_one_record() {
        let h = Harness::new();
        h.queue.publish_json(&json!({"id": "ord-1", "amount": 42}));
        h.queue.publish_json(&json!({"id": "ord-1", "amount": 42}));

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.stored, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(h.store.count_orders(), 1);
        assert_eq!(h.queue.acknowledged().len(), 2);
    }

    #[tokio::test]
    async fn poison_is_acknowledged_and_does_not_block() {
        let h = Harness::new();
        let poison = h.queue.publish("definitely not json");
        h.queue.publish_json(&json!({"id": "ord-2", "amount": 1}));

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.poisoned, 1);
        assert_eq!(stats.stored, 1);
        assert_eq!(h.queue.acknowledged()[0], poison);
        assert_eq!(h.queue.release_count(), 0);
        let ledger = h.store.poison_messages();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].receipt, poison);
    }

    #[tokio::test]
    async fn poison_ledger_failure_still_acknowledges() {
        let h = Harness::new();
        h.store.fail_poison_records(true);
        h.queue.publish("[]");

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.poisoned, 1);
        assert_eq!(h.queue.acknowledged().len(), 1);
        assert!(h.store.poison_messages().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_releases_then_redelivery_succeeds() {
        let h = Harness::new();
        h.store.fail_next_upserts(2);
        let receipt = h.queue.publish_json(&json!({"id": "ord-3", "amount": 5}));

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.deferred, 2);
        assert_eq!(stats.stored, 1);
        assert_eq!(h.queue.release_count(), 2);
        assert_eq!(h.queue.acknowledged(), vec![receipt]);
        assert_eq!(h.store.count_orders(), 1);
    }

    #[tokio::test]
    async fn permanently_refused_order_is_poisoned_not_released() {
        let h = Harness::new();
        h.store.reject_next_upserts(1);
        let refused = h.queue.publish_json(&json!({"id": "ord-10", "amount": 5}));
        let next = h.queue.publish_json(&json!({"id": "ord-11", "amount": 5}));

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.poisoned, 1);
        assert_eq!(stats.deferred, 0);
        assert_eq!(stats.stored, 1);
        assert_eq!(h.queue.release_count(), 0);
        assert_eq!(h.queue.acknowledged(), vec![refused.clone(), next]);
        assert!(h.store.fetch_order(&order_id("ord-10")).is_none());
        let ledger = h.store.poison_messages();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].receipt, refused);
        assert!(ledger[0].error.starts_with("Record rejected"));
    }

    #[tokio::test]
    async fn nul_in_payload_is_poisoned_before_reaching_the_store() {
        let h = Harness::new();
        h.queue.publish(r#"{"id": "ord\u0000x", "amount": 1}"#);

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.poisoned, 1);
        assert_eq!(h.store.upsert_calls(), 0);
        assert_eq!(h.queue.acknowledged().len(), 1);
    }

    #[tokio::test]
    async fn released_message_is_not_acknowledged() {
        let h = Harness::new();
        h.store.fail_next_upserts(1);
        h.queue.publish_json(&json!({"id": "ord-4", "amount": 5}));

        let mut subscription = h.queue.subscribe().await.unwrap();
        let message = subscription.receive().await.unwrap();
        let (_tx, rx) = shutdown::channel();
        let mut consumer = h.consumer(rx, ConsumerConfig::immediate(3));

        let disposition = consumer.handle(subscription.as_mut(), message).await.unwrap();

        assert_eq!(disposition, Disposition::Deferred);
        assert!(h.queue.acknowledged().is_empty());
        assert_eq!(h.queue.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_backs_off_exponentially() {
        let h = Harness::new();
        h.store.fail_next_upserts(3);
        h.queue.publish_json(&json!({"id": "ord-5", "amount": 5}));
        let started = tokio::time::Instant::now();

        h.drain(ConsumerConfig::default()).await.unwrap();

        // 500ms + 1s + 2s
        assert_eq!(started.elapsed(), Duration::from_millis(3500));
    }

    #[tokio::test]
    async fn reopens_subscription_after_connection_loss() {
        let h = Harness::new();
        h.queue.fail_next_receives(2);
        h.queue.publish_json(&json!({"id": "ord-6", "amount": 5}));

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.resubscriptions, 2);
        assert_eq!(stats.stored, 1);
        assert_eq!(h.queue.subscription_count(), 3);
    }

    #[tokio::test]
    async fn failed_acknowledgement_redelivers_without_duplicate_record() {
        let h = Harness::new();
        h.queue.fail_next_acks(1);
        h.queue.publish_json(&json!({"id": "ord-7", "amount": 5}));

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.stored, 0);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.resubscriptions, 1);
        assert_eq!(h.store.count_orders(), 1);
    }

    #[tokio::test]
    async fn subscribes_within_budget() {
        let h = Harness::new();
        h.queue.fail_next_subscribes(2);
        h.queue.publish_json(&json!({"id": "ord-8", "amount": 5}));

        let stats = h.drain(ConsumerConfig::immediate(3)).await.unwrap();

        assert_eq!(stats.stored, 1);
        assert_eq!(h.queue.subscription_count(), 1);
    }

    #[tokio::test]
    async fn queue_lost_after_resubscribe_budget() {
        let h = Harness::new();
        h.queue.fail_next_subscribes(3);
        h.queue.publish_json(&json!({"id": "ord-8", "amount": 5}));
        let (_tx, rx) = shutdown::channel();

        let err = h
            .consumer(rx, ConsumerConfig::immediate(3))
            .run()
            .await
            .unwrap_err();

        let ConsumerError::QueueConnectionLost { attempts, reason } = err;
        assert_eq!(attempts, 3);
        assert!(matches!(reason, QueueError::SubscriptionFailed { .. }));
        assert_eq!(h.store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn stops_on_shutdown_while_idle() {
        let h = Harness::new();
        let (tx, rx) = shutdown::channel();
        let consumer = h.consumer(rx, ConsumerConfig::immediate(3));

        let handle = tokio::spawn(consumer.run());
        tokio::task::yield_now().await;
        tx.send_replace(true);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }

    #[tokio::test]
    async fn shutdown_before_start_receives_nothing() {
        let h = Harness::new();
        h.queue.publish_json(&json!({"id": "ord-9", "amount": 5}));
        let (tx, rx) = shutdown::channel();
        tx.send_replace(true);

        let stats = h.consumer(rx, ConsumerConfig::immediate(3)).run().await.unwrap();

        assert_eq!(stats.received, 0);
        assert_eq!(h.queue.pending_len(), 1);
    }

    proptest! {
        #[test]
        fn one_record_per_distinct_id(ids in proptest::collection::vec(0_u8..8, 1..40)) {
            let h = Harness::new();
            for id in &ids {
                h.queue.publish_json(&json!({"id": format!("ord-{id}"), "amount": 1}));
            }

            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let stats = runtime.block_on(h.drain(ConsumerConfig::immediate(3))).unwrap();

            let distinct: std::collections::BTreeSet<_> = ids.iter().collect();
            prop_assert_eq!(h.store.count_orders(), distinct.len());
            prop_assert_eq!(stats.stored, distinct.len() as u64);
            prop_assert_eq!(stats.received, ids.len() as u64);
        }
    }
}
