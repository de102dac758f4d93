//! # Billing Core
//!
//! Domain types and collaborator traits for the billing order ingestion service.
//!
//! The service waits for its database, makes sure the billing schema exists, and then
//! turns order events from a message queue into committed billing rows. This crate holds
//! everything that path needs to talk about without doing any I/O itself:
//!
//! - [`connection::ConnectionTarget`]: where the billing database lives
//! - [`schema::SchemaDescriptor`]: the tables the billing domain requires
//! - [`order::OrderMessage`] / [`order::OrderRecord`]: inbound payload and its durable form
//! - [`store::OrderStore`]: storage collaborator (probe, schema, idempotent upsert)
//! - [`queue::OrderQueue`] / [`queue::OrderSubscription`]: queue collaborator
//!   (receive, acknowledge, release)
//!
//! ## Delivery Model
//!
//! - **At-least-once from the queue**: the same order may arrive more than once
//! - **At-most-one effect in the store**: writes are keyed on the order identifier
//! - **Ack after commit**: a message is acknowledged only once its row is durable
//!
//! ## Example
//!
//! ```ignore
//! use billing_core::order::{OrderMessage, OrderRecord};
//!
//! let record = OrderRecord::from_message(&message)?;
//! match store.upsert_order(&record).await? {
//!     UpsertOutcome::Inserted => subscription.acknowledge(&message.receipt).await?,
//!     UpsertOutcome::Duplicate => subscription.acknowledge(&message.receipt).await?,
//! }
//! ```

pub mod config;
pub mod connection;
pub mod order;
pub mod queue;
pub mod schema;
pub mod store;

pub use config::ConfigError;
pub use connection::ConnectionTarget;
pub use order::{DeliveryReceipt, MalformedMessage, OrderId, OrderMessage, OrderRecord, PoisonMessage};
pub use queue::{OrderQueue, OrderSubscription, QueueError};
pub use schema::SchemaDescriptor;
pub use store::{OrderStore, StoreError, UpsertOutcome};
