//! Queue collaborator for inbound order events.
//!
//! An [`OrderQueue`] opens subscriptions; an [`OrderSubscription`] hands out one
//! message at a time and is told what happened to it:
//!
//! - [`OrderSubscription::acknowledge`]: the message is done (stored, duplicate, or
//!   poison) and must not be delivered again
//! - [`OrderSubscription::release`]: the message was not stored and must be delivered
//!   again, ahead of anything later on the same partition
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a message may be delivered more than once, especially after a
//!   reconnect; consumers rely on idempotent storage
//! - **Ordered within partition**: messages sharing a key keep their order
//! - **Ack after commit**: callers acknowledge only after the storage transaction
//!   committed
//!
//! # Implementations
//!
//! - `RedpandaOrderQueue` (in `billing-redpanda`): Kafka-compatible, manual commits
//! - `InMemoryOrderQueue` (in `billing-testing`): scripted deliveries for tests

use crate::order::{DeliveryReceipt, OrderMessage};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by queue collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A subscription could not be opened.
    #[error("Subscription to '{topic}' failed: {reason}")]
    SubscriptionFailed {
        /// Topic that could not be subscribed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// An open subscription stopped delivering.
    #[error("Queue connection lost: {0}")]
    ConnectionLost(String),

    /// An acknowledgement was not accepted.
    #[error("Acknowledge failed for {receipt}: {reason}")]
    Acknowledge {
        /// Delivery that could not be acknowledged
        receipt: DeliveryReceipt,
        /// The reason for failure
        reason: String,
    },

    /// A release (negative acknowledgement) was not accepted.
    #[error("Release failed for {receipt}: {reason}")]
    Release {
        /// Delivery that could not be released
        receipt: DeliveryReceipt,
        /// The reason for failure
        reason: String,
    },
}

/// Boxed future returned by queue collaborators.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

/// Source of order subscriptions.
pub trait OrderQueue: Send + Sync {
    /// Open a new subscription.
    ///
    /// Deliveries that were received but never acknowledged on an earlier
    /// subscription are delivered again.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SubscriptionFailed`] if the subscription cannot be opened.
    fn subscribe(&self) -> QueueFuture<'_, Box<dyn OrderSubscription>>;
}

/// An open subscription delivering one message at a time.
pub trait OrderSubscription: Send {
    /// Wait for the next message.
    ///
    /// Suspends until a message is available. Dropping the returned future before it
    /// completes must not lose a message.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionLost`] if the subscription stopped delivering.
    fn receive(&mut self) -> QueueFuture<'_, OrderMessage>;

    /// Mark a delivery as finished.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Acknowledge`] if the queue rejected the acknowledgement;
    /// the message may then be delivered again.
    fn acknowledge<'a>(&'a mut self, receipt: &'a DeliveryReceipt) -> QueueFuture<'a, ()>;

    /// Hand a delivery back for redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Release`] if the queue rejected the release.
    fn release<'a>(&'a mut self, receipt: &'a DeliveryReceipt) -> QueueFuture<'a, ()>;
}
