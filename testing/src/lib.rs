//! # Billing Testing
//!
//! In-memory collaborators for exercising the ingestion path without a database or
//! a broker.
//!
//! This crate provides:
//! - [`InMemoryOrderStore`]: `OrderStore` with scripted probe, upsert, schema and
//!   poison failures
//! - [`InMemoryOrderQueue`]: `OrderQueue` with redelivery of released and
//!   unacknowledged messages, plus scripted connection drops
//! - [`strategies`]: proptest strategies for order payloads
//!
//! ## Example
//!
//! ```
//! use billing_testing::{InMemoryOrderQueue, InMemoryOrderStore};
//!
//! let store = InMemoryOrderStore::new();
//! store.fail_next_pings(3);
//!
//! let queue = InMemoryOrderQueue::new("billing_queue");
//! queue.publish(r#"{"id": "ord-1", "amount": 42}"#);
//! assert_eq!(queue.pending_len(), 1);
//! ```

pub mod queue;
pub mod store;

/// Proptest strategies for order payloads.
pub mod strategies {
    use proptest::prelude::*;
    use serde_json::json;

    /// Order identifiers as producers send them.
    pub fn order_id() -> impl Strategy<Value = String> {
        "ord-[a-z0-9]{1,12}"
    }

    /// Well-formed order payloads.
    pub fn order_payload() -> impl Strategy<Value = Vec<u8>> {
        (order_id(), -100_000_i64..100_000).prop_map(|(id, amount)| {
            json!({ "id": id, "amount": amount }).to_string().into_bytes()
        })
    }

    /// Payloads that can never be mapped to an order.
    pub fn malformed_payload() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            Just(b"not json".to_vec()),
            Just(b"[1, 2, 3]".to_vec()),
            Just(br#"{"amount": 1}"#.to_vec()),
            Just(br#"{"id": "ord-x"}"#.to_vec()),
            Just(br#"{"id": "", "amount": 1}"#.to_vec()),
        ]
    }
}

pub use queue::InMemoryOrderQueue;
pub use store::InMemoryOrderStore;
