//! In-memory order queue with redelivery and scripted connection drops.
//!
//! Models the delivery contract of a partitioned log on a single partition:
//!
//! - messages are delivered in publish order
//! - a released message goes back to the head of the queue, flagged as redelivered
//! - opening a new subscription redelivers everything received but not acknowledged

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use billing_core::order::{DeliveryReceipt, OrderMessage};
use billing_core::queue::{OrderQueue, OrderSubscription, QueueError, QueueFuture};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, watch};

const PARTITION: i32 = 0;

#[derive(Debug, Default)]
struct QueueState {
    next_offset: i64,
    pending: VecDeque<OrderMessage>,
    in_flight: BTreeMap<i64, OrderMessage>,
    acknowledged: Vec<DeliveryReceipt>,
    releases: usize,
    subscriptions: usize,
    failing_subscribes: usize,
    failing_receives: usize,
    failing_acks: usize,
    on_drained: Option<watch::Sender<bool>>,
}

impl QueueState {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn signal_if_drained(&mut self) {
        if self.is_drained() {
            if let Some(sender) = self.on_drained.take() {
                let _ = sender.send(true);
            }
        }
    }
}

/// Single-partition [`OrderQueue`] held in memory.
///
/// Clones share the same queue, so a test can keep one handle for publishing and
/// assertions while the consumer owns another.
///
/// # Example
///
/// ```
/// use billing_testing::InMemoryOrderQueue;
/// use billing_core::queue::OrderQueue;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = InMemoryOrderQueue::new("billing_queue");
/// queue.publish(r#"{"id": "ord-1", "amount": 42}"#);
///
/// let mut subscription = queue.subscribe().await?;
/// let message = subscription.receive().await?;
/// subscription.acknowledge(&message.receipt).await?;
///
/// assert_eq!(queue.acknowledged().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryOrderQueue {
    topic: String,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryOrderQueue {
    /// Create an empty queue for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append a message and return its receipt.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> DeliveryReceipt {
        self.push(payload.into(), None)
    }

    /// Append a keyed message and return its receipt.
    pub fn publish_keyed(&self, key: impl Into<String>, payload: impl Into<Vec<u8>>) -> DeliveryReceipt {
        self.push(payload.into(), Some(key.into()))
    }

    /// Append a JSON payload and return its receipt.
    pub fn publish_json(&self, payload: &Value) -> DeliveryReceipt {
        self.publish(payload.to_string())
    }

    fn push(&self, payload: Vec<u8>, key: Option<String>) -> DeliveryReceipt {
        let receipt = {
            let mut state = self.state.lock().unwrap();
            let receipt = DeliveryReceipt::new(self.topic.clone(), PARTITION, state.next_offset);
            state.next_offset += 1;

            let mut message = OrderMessage::new(payload, receipt.clone());
            message.key = key;
            state.pending.push_back(message);
            receipt
        };
        self.notify.notify_one();
        receipt
    }

    /// Send `true` on `sender` once every published message has been acknowledged.
    ///
    /// Fires immediately if the queue is already drained.
    pub fn shutdown_when_drained(&self, sender: watch::Sender<bool>) {
        let mut state = self.state.lock().unwrap();
        state.on_drained = Some(sender);
        state.signal_if_drained();
    }

    /// Make the next `n` subscription attempts fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.state.lock().unwrap().failing_subscribes = n;
    }

    /// Make the next `n` receives fail with [`QueueError::ConnectionLost`].
    pub fn fail_next_receives(&self, n: usize) {
        self.state.lock().unwrap().failing_receives = n;
    }

    /// Make the next `n` acknowledgements fail.
    pub fn fail_next_acks(&self, n: usize) {
        self.state.lock().unwrap().failing_acks = n;
    }

    /// Receipts acknowledged so far, in acknowledgement order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<DeliveryReceipt> {
        self.state.lock().unwrap().acknowledged.clone()
    }

    /// Messages waiting to be received.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Messages received but neither acknowledged nor released.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    /// Number of releases (negative acknowledgements).
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    /// Number of subscriptions successfully opened.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }
}

impl OrderQueue for InMemoryOrderQueue {
    fn subscribe(&self) -> QueueFuture<'_, Box<dyn OrderSubscription>> {
        let mut state = self.state.lock().unwrap();

        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Box::pin(future::ready(Err(QueueError::SubscriptionFailed {
                topic: self.topic.clone(),
                reason: "injected subscribe failure".to_string(),
            })));
        }

        // Unacknowledged deliveries go back ahead of everything else, in offset order
        let in_flight = std::mem::take(&mut state.in_flight);
        for (_, mut message) in in_flight.into_iter().rev() {
            message.redelivered = true;
            state.pending.push_front(message);
        }
        state.subscriptions += 1;
        drop(state);

        if self.pending_len() > 0 {
            self.notify.notify_one();
        }

        let subscription: Box<dyn OrderSubscription> = Box::new(InMemorySubscription {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        });
        Box::pin(future::ready(Ok(subscription)))
    }
}

struct InMemorySubscription {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemorySubscription {
    fn try_take(&self) -> Option<Result<OrderMessage, QueueError>> {
        let mut state = self.state.lock().unwrap();

        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            return Some(Err(QueueError::ConnectionLost(
                "injected connection drop".to_string(),
            )));
        }

        let message = state.pending.pop_front()?;
        state.in_flight.insert(message.receipt.offset, message.clone());
        Some(Ok(message))
    }
}

impl OrderSubscription for InMemorySubscription {
    fn receive(&mut self) -> QueueFuture<'_, OrderMessage> {
        Box::pin(async move {
            loop {
                // Taking a message never spans an await, so dropping this future loses nothing
                if let Some(result) = self.try_take() {
                    return result;
                }
                self.notify.notified().await;
            }
        })
    }

    fn acknowledge<'a>(&'a mut self, receipt: &'a DeliveryReceipt) -> QueueFuture<'a, ()> {
        let mut state = self.state.lock().unwrap();

        let result = if state.failing_acks > 0 {
            state.failing_acks -= 1;
            Err(QueueError::Acknowledge {
                receipt: receipt.clone(),
                reason: "injected acknowledge failure".to_string(),
            })
        } else {
            if state.in_flight.remove(&receipt.offset).is_some() {
                state.acknowledged.push(receipt.clone());
            }
            state.signal_if_drained();
            Ok(())
        };

        Box::pin(future::ready(result))
    }

    fn release<'a>(&'a mut self, receipt: &'a DeliveryReceipt) -> QueueFuture<'a, ()> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(mut message) = state.in_flight.remove(&receipt.offset) {
                message.redelivered = true;
                state.pending.push_front(message);
                state.releases += 1;
            }
        }
        self.notify.notify_one();

        Box::pin(future::ready(Ok(())))
    }
}
