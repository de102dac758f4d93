//! Order messages and their durable billing form.
//!
//! An [`OrderMessage`] is what the queue hands over: raw bytes plus delivery metadata.
//! An [`OrderRecord`] is what lands in the billing store, derived one-to-one from a
//! message by [`OrderRecord::from_message`]. A message that cannot be mapped becomes a
//! [`PoisonMessage`] instead of being retried forever.
//!
//! # Payload Format
//!
//! Payloads are JSON objects with at least an identifier and an amount:
//!
//! ```json
//! { "id": "ord-1", "amount": 42 }
//! ```
//!
//! - `id`: non-empty string, or a non-negative integer (stored as its decimal text)
//! - `amount`: JSON number; stored in cents, rounded half away from zero
//!
//! Any other fields are kept verbatim in the record's `contents`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Unique order identifier, the idempotency key for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Wrap an identifier.
    #[must_use]
    pub const fn new(id: String) -> Self {
        Self(id)
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a message came from, and what has to be acknowledged or released.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Topic (or queue name) the message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl DeliveryReceipt {
    /// Create a receipt.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for DeliveryReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// One order event as received from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderMessage {
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Partitioning key, if the producer set one
    pub key: Option<String>,
    /// Delivery position, used to acknowledge or release the message
    pub receipt: DeliveryReceipt,
    /// Whether this consumer has seen this delivery before
    pub redelivered: bool,
    /// When this consumer received the message
    pub received_at: DateTime<Utc>,
}

impl OrderMessage {
    /// Create a first-time delivery received now.
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>, receipt: DeliveryReceipt) -> Self {
        Self {
            payload: payload.into(),
            key: None,
            receipt,
            redelivered: false,
            received_at: Utc::now(),
        }
    }

    /// Set the partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Reasons a payload cannot become an [`OrderRecord`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    /// The payload is not valid JSON.
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    /// The payload is JSON but not an object.
    #[error("Payload is not a JSON object")]
    NotAnObject,

    /// A required field is absent or null.
    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    /// A field is present but has an unusable value.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// The offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// A string in the payload contains a NUL character, which the store cannot hold.
    #[error("Payload contains a NUL character")]
    ContainsNul,
}

/// Durable billing representation of one order.
///
/// Created once per order identifier and never updated by the ingestion path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRecord {
    /// Order identifier (primary key)
    pub order_id: OrderId,
    /// Order amount in cents
    pub amount_cents: i64,
    /// Full order payload as received
    pub contents: Value,
    /// Delivery the record was derived from
    pub source: DeliveryReceipt,
    /// When the message was received
    pub received_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Map a queue message to a record.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage`] if the payload is not a JSON object with a usable
    /// `id` and `amount`.
    pub fn from_message(message: &OrderMessage) -> Result<Self, MalformedMessage> {
        let contents: Value = serde_json::from_slice(&message.payload)
            .map_err(|e| MalformedMessage::InvalidJson(e.to_string()))?;

        let object = contents.as_object().ok_or(MalformedMessage::NotAnObject)?;
        if contains_nul(&contents) {
            return Err(MalformedMessage::ContainsNul);
        }

        let order_id = parse_order_id(object.get("id"))?;
        let amount_cents = parse_amount_cents(object.get("amount"))?;

        Ok(Self {
            order_id,
            amount_cents,
            contents,
            source: message.receipt.clone(),
            received_at: message.received_at,
        })
    }
}

impl TryFrom<&OrderMessage> for OrderRecord {
    type Error = MalformedMessage;

    fn try_from(message: &OrderMessage) -> Result<Self, Self::Error> {
        Self::from_message(message)
    }
}

/// Whether any key or string value, at any depth, contains `\0`.
fn contains_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(contains_nul),
        Value::Object(fields) => fields
            .iter()
            .any(|(key, field)| key.contains('\0') || contains_nul(field)),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

fn parse_order_id(value: Option<&Value>) -> Result<OrderId, MalformedMessage> {
    match value {
        None | Some(Value::Null) => Err(MalformedMessage::MissingField("id")),
        Some(Value::String(id)) if id.trim().is_empty() => Err(MalformedMessage::InvalidField {
            field: "id",
            reason: "identifier is empty".to_string(),
        }),
        Some(Value::String(id)) => Ok(OrderId::new(id.clone())),
        Some(Value::Number(n)) => n.as_u64().map(|id| OrderId::new(id.to_string())).ok_or_else(|| {
            MalformedMessage::InvalidField {
                field: "id",
                reason: format!("numeric identifier must be a non-negative integer, got {n}"),
            }
        }),
        Some(other) => Err(MalformedMessage::InvalidField {
            field: "id",
            reason: format!("expected string or integer, got {other}"),
        }),
    }
}

#[allow(clippy::cast_possible_truncation)] // range is checked before the cast
fn parse_amount_cents(value: Option<&Value>) -> Result<i64, MalformedMessage> {
    let invalid = |reason: String| MalformedMessage::InvalidField {
        field: "amount",
        reason,
    };

    match value {
        None | Some(Value::Null) => Err(MalformedMessage::MissingField("amount")),
        Some(Value::Number(n)) => {
            if let Some(whole) = n.as_i64() {
                return whole
                    .checked_mul(100)
                    .ok_or_else(|| invalid(format!("{n} is out of range")));
            }
            let Some(float) = n.as_f64() else {
                return Err(invalid(format!("{n} is not representable")));
            };
            let cents = (float * 100.0).round();
            if cents.is_finite() && cents >= i64::MIN as f64 && cents < i64::MAX as f64 {
                Ok(cents as i64)
            } else {
                Err(invalid(format!("{n} is out of range")))
            }
        }
        Some(other) => Err(invalid(format!("expected a number, got {other}"))),
    }
}

/// A message that was acknowledged without being stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonMessage {
    /// Delivery position of the rejected message
    pub receipt: DeliveryReceipt,
    /// Partitioning key, if any
    pub key: Option<String>,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Why the message was rejected
    pub error: String,
    /// When the message was received
    pub received_at: DateTime<Utc>,
}

impl PoisonMessage {
    /// Capture a rejected message together with the reason it was rejected: a
    /// mapping error, or a store error that retrying cannot fix.
    #[must_use]
    pub fn new(message: &OrderMessage, error: &impl fmt::Display) -> Self {
        Self {
            receipt: message.receipt.clone(),
            key: message.key.clone(),
            payload: message.payload.clone(),
            error: error.to_string(),
            received_at: message.received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn message(payload: &[u8]) -> OrderMessage {
        OrderMessage::new(payload.to_vec(), DeliveryReceipt::new("billing_queue", 0, 7))
    }

    #[test]
    fn maps_minimal_order() {
        let record = OrderRecord::from_message(&message(br#"{"id": "ord-1", "amount": 42}"#)).unwrap();

        assert_eq!(record.order_id.as_str(), "ord-1");
        assert_eq!(record.amount_cents, 4200);
        assert_eq!(record.contents, json!({"id": "ord-1", "amount": 42}));
        assert_eq!(record.source, DeliveryReceipt::new("billing_queue", 0, 7));
    }

    #[test]
    fn keeps_extra_fields_and_rounds_fractional_amounts() {
        let record = OrderRecord::from_message(&message(
            br#"{"id": "ord-2", "amount": 19.99, "items": [{"sku": "A", "qty": 2}]}"#,
        ))
        .unwrap();

        assert_eq!(record.amount_cents, 1999);
        assert_eq!(record.contents["items"][0]["sku"], "A");
    }

    #[test]
    fn integer_ids_become_text() {
        let record = OrderRecord::from_message(&message(br#"{"id": 17, "amount": 1}"#)).unwrap();
        assert_eq!(record.order_id, OrderId::new("17".to_string()));
    }

    #[test]
    fn rejects_non_json() {
        let err = OrderRecord::from_message(&message(b"not json")).unwrap_err();
        assert!(matches!(err, MalformedMessage::InvalidJson(_)));
    }

    #[test]
    fn rejects_non_objects() {
        let err = OrderRecord::from_message(&message(b"[1, 2, 3]")).unwrap_err();
        assert_eq!(err, MalformedMessage::NotAnObject);
    }

    #[test]
    fn rejects_missing_id_and_amount() {
        assert_eq!(
            OrderRecord::from_message(&message(br#"{"amount": 1}"#)).unwrap_err(),
            MalformedMessage::MissingField("id")
        );
        assert_eq!(
            OrderRecord::from_message(&message(br#"{"id": "ord-3"}"#)).unwrap_err(),
            MalformedMessage::MissingField("amount")
        );
    }

    #[test]
    fn rejects_blank_id_and_textual_amount() {
        assert!(matches!(
            OrderRecord::from_message(&message(br#"{"id": " ", "amount": 1}"#)).unwrap_err(),
            MalformedMessage::InvalidField { field: "id", .. }
        ));
        assert!(matches!(
            OrderRecord::from_message(&message(br#"{"id": "ord-4", "amount": "12"}"#)).unwrap_err(),
            MalformedMessage::InvalidField { field: "amount", .. }
        ));
    }

    #[test]
    fn rejects_nul_in_id_or_contents() {
        assert_eq!(
            OrderRecord::from_message(&message(br#"{"id": "ord\u0000x", "amount": 1}"#)).unwrap_err(),
            MalformedMessage::ContainsNul
        );
        assert_eq!(
            OrderRecord::from_message(&message(
                br#"{"id": "ord-5", "amount": 1, "items": [{"sku": "A\u0000"}]}"#
            ))
            .unwrap_err(),
            MalformedMessage::ContainsNul
        );
        assert_eq!(
            OrderRecord::from_message(&message(br#"{"id": "ord-6", "amount": 1, "n\u0000te": 2}"#))
                .unwrap_err(),
            MalformedMessage::ContainsNul
        );
    }

    #[test]
    fn poison_message_keeps_raw_payload() {
        let msg = message(b"garbage").with_key("k");
        let err = OrderRecord::from_message(&msg).unwrap_err();
        let poison = PoisonMessage::new(&msg, &err);

        assert_eq!(poison.payload, b"garbage");
        assert_eq!(poison.key.as_deref(), Some("k"));
        assert!(poison.error.starts_with("Payload is not valid JSON"));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = OrderRecord::from_message(&message(&bytes));
        }

        #[test]
        fn well_formed_orders_always_map(id in "[a-z0-9-]{1,24}", amount in -1_000_000_i64..1_000_000) {
            let payload = json!({"id": id, "amount": amount}).to_string();
            let record = OrderRecord::from_message(&message(payload.as_bytes())).unwrap();
            prop_assert_eq!(record.order_id.as_str(), id.as_str());
            prop_assert_eq!(record.amount_cents, amount * 100);
        }
    }
}
