//! Redpanda order queue for billing ingestion.
//!
//! Implements the `OrderQueue` trait from `billing-core` with an rdkafka
//! `StreamConsumer`. Works against Redpanda or any other Kafka-compatible broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Auto-commit is disabled; an offset is committed only when the consumer loop
//!   acknowledges the message, which it does after the database commit
//! - Releasing a message seeks its partition back to it, so it is read again before
//!   anything later on that partition. The released position is remembered by the
//!   queue, not the subscription, so the redelivery is flagged even when it arrives
//!   on a subscription opened after the old one was lost
//! - Transient broker errors while reading (transport failure, timeouts) are retried
//!   on the same consumer; only persistent ones surface as a lost connection
//! - If the process crashes before a commit, the message is redelivered after
//!   restart; the store's idempotent upsert absorbs the duplicate
//! - Ordering is guaranteed within a partition (producers key orders by customer or
//!   order identifier)
//!
//! # Example
//!
//! ```no_run
//! use billing_redpanda::RedpandaOrderQueue;
//! use billing_core::queue::OrderQueue;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaOrderQueue::builder()
//!     .brokers("localhost:9092")
//!     .topic("billing_queue")
//!     .consumer_group("billing-app")
//!     .build()?;
//!
//! let mut subscription = queue.subscribe().await?;
//! let message = subscription.receive().await?;
//! // ... persist, then:
//! subscription.acknowledge(&message.receipt).await?;
//! # Ok(())
//! # }
//! ```

use billing_core::order::{DeliveryReceipt, OrderMessage};
use billing_core::queue::{OrderQueue, OrderSubscription, QueueError, QueueFuture};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::collections::HashSet;
use std::future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Consecutive transient read errors tolerated before the connection counts as lost.
const MAX_TRANSIENT_RECV_ERRORS: u32 = 5;

/// Kafka-compatible [`OrderQueue`].
///
/// Every [`subscribe`](OrderQueue::subscribe) call creates a fresh consumer that
/// joins the configured group. Clones share the set of released positions.
#[derive(Debug, Clone)]
pub struct RedpandaOrderQueue {
    brokers: String,
    topic: String,
    consumer_group: String,
    auto_offset_reset: String,
    session_timeout: Duration,
    seek_timeout: Duration,
    released: ReleasedPositions,
}

/// Positions handed back with `release`; the next read of each is a redelivery.
#[derive(Debug, Clone, Default)]
struct ReleasedPositions(Arc<Mutex<HashSet<(String, i32, i64)>>>);

impl ReleasedPositions {
    fn mark(&self, receipt: &DeliveryReceipt) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(position(receipt));
    }

    /// Forget `receipt`, reporting whether it had been released.
    fn take(&self, receipt: &DeliveryReceipt) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&position(receipt))
    }
}

impl RedpandaOrderQueue {
    /// Create a builder for configuring the queue.
    #[must_use]
    pub fn builder() -> RedpandaOrderQueueBuilder {
        RedpandaOrderQueueBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Topic orders are read from.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group shared by all replicas.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Consumer configuration with manual commits.
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");
        config
    }
}

/// Builder for [`RedpandaOrderQueue`].
///
/// # Example
///
/// ```no_run
/// use billing_redpanda::RedpandaOrderQueue;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = RedpandaOrderQueue::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .topic("billing_queue")
///     .auto_offset_reset("latest")
///     .session_timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaOrderQueueBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
    seek_timeout: Option<Duration>,
}

impl RedpandaOrderQueueBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic to consume.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group (default: `billing-app`).
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a group without committed offsets starts reading.
    ///
    /// - `"earliest"` (default): every message still retained by the broker
    /// - `"latest"`: only messages produced after the group first joins
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout (default: 6 seconds).
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set how long a release may block while seeking (default: 5 seconds).
    #[must_use]
    pub const fn seek_timeout(mut self, timeout: Duration) -> Self {
        self.seek_timeout = Some(timeout);
        self
    }

    /// Build the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SubscriptionFailed`] if brokers or topic are not set.
    pub fn build(self) -> Result<RedpandaOrderQueue, QueueError> {
        let topic = self.topic.ok_or_else(|| QueueError::SubscriptionFailed {
            topic: String::new(),
            reason: "Topic not configured".to_string(),
        })?;
        let brokers = self.brokers.ok_or_else(|| QueueError::SubscriptionFailed {
            topic: topic.clone(),
            reason: "Brokers not configured".to_string(),
        })?;

        Ok(RedpandaOrderQueue {
            brokers,
            topic,
            consumer_group: self.consumer_group.unwrap_or_else(|| "billing-app".to_string()),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
            seek_timeout: self.seek_timeout.unwrap_or(Duration::from_secs(5)),
            released: ReleasedPositions::default(),
        })
    }
}

impl OrderQueue for RedpandaOrderQueue {
    fn subscribe(&self) -> QueueFuture<'_, Box<dyn OrderSubscription>> {
        let result = self.open();
        Box::pin(future::ready(result))
    }
}

impl RedpandaOrderQueue {
    fn open(&self) -> Result<Box<dyn OrderSubscription>, QueueError> {
        let failed = |reason: String| QueueError::SubscriptionFailed {
            topic: self.topic.clone(),
            reason,
        };

        let consumer: StreamConsumer = self
            .client_config()
            .create()
            .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| failed(format!("Failed to subscribe: {e}")))?;

        tracing::info!(
            brokers = %self.brokers,
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            auto_offset_reset = %self.auto_offset_reset,
            manual_commit = true,
            "Subscribed to order topic"
        );

        Ok(Box::new(RedpandaSubscription {
            consumer,
            seek_timeout: self.seek_timeout,
            released: self.released.clone(),
        }))
    }
}

/// One consumer-group member reading the order topic.
struct RedpandaSubscription {
    consumer: StreamConsumer,
    seek_timeout: Duration,
    released: ReleasedPositions,
}

/// Offset to commit so that the group resumes after `receipt`.
const fn commit_offset(receipt: &DeliveryReceipt) -> i64 {
    receipt.offset + 1
}

fn position(receipt: &DeliveryReceipt) -> (String, i32, i64) {
    (receipt.topic.clone(), receipt.partition, receipt.offset)
}

/// Read errors librdkafka recovers from on its own by reconnecting.
fn is_transient_recv_error(error: &KafkaError) -> bool {
    matches!(
        error,
        KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::LeaderNotAvailable
        )
    )
}

impl OrderSubscription for RedpandaSubscription {
    fn receive(&mut self) -> QueueFuture<'_, OrderMessage> {
        Box::pin(async move {
            let mut transient_errors = 0_u32;
            let message = loop {
                match self.consumer.recv().await {
                    Ok(message) => break message,
                    Err(error)
                        if is_transient_recv_error(&error)
                            && transient_errors < MAX_TRANSIENT_RECV_ERRORS =>
                    {
                        transient_errors += 1;
                        tracing::warn!(
                            error = %error,
                            attempt = transient_errors,
                            "Transient consumer error, reading again"
                        );
                    }
                    Err(error) => return Err(QueueError::ConnectionLost(error.to_string())),
                }
            };

            let receipt = DeliveryReceipt::new(message.topic(), message.partition(), message.offset());
            let mut order = OrderMessage::new(message.payload().unwrap_or_default(), receipt);
            order.key = message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned());
            order.redelivered = self.released.take(&order.receipt);

            Ok(order)
        })
    }

    fn acknowledge<'a>(&'a mut self, receipt: &'a DeliveryReceipt) -> QueueFuture<'a, ()> {
        let failed = |reason: String| QueueError::Acknowledge {
            receipt: receipt.clone(),
            reason,
        };

        let mut offsets = TopicPartitionList::new();
        let result = offsets
            .add_partition_offset(
                &receipt.topic,
                receipt.partition,
                Offset::Offset(commit_offset(receipt)),
            )
            .map_err(|e| failed(e.to_string()))
            .and_then(|()| {
                self.consumer
                    .commit(&offsets, CommitMode::Async)
                    .map_err(|e| failed(e.to_string()))
            });

        if let Err(error) = &result {
            tracing::warn!(
                receipt = %receipt,
                error = %error,
                "Failed to commit offset (message may be redelivered)"
            );
        }

        Box::pin(future::ready(result))
    }

    fn release<'a>(&'a mut self, receipt: &'a DeliveryReceipt) -> QueueFuture<'a, ()> {
        let result = self
            .consumer
            .seek(
                &receipt.topic,
                receipt.partition,
                Offset::Offset(receipt.offset),
                Timeout::After(self.seek_timeout),
            )
            .map_err(|e| QueueError::Release {
                receipt: receipt.clone(),
                reason: e.to_string(),
            });

        if result.is_ok() {
            self.released.mark(receipt);
            tracing::debug!(receipt = %receipt, "Seeked back for redelivery");
        }

        Box::pin(future::ready(result))
    }
}
