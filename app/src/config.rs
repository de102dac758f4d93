//! Configuration for the billing service.
//!
//! Loaded from environment variables (optionally seeded from a `.env` file by the
//! binary). Database credentials are required; everything else has a default.
//! Values that are present but malformed are errors, never silently defaulted.

use billing_core::config::{self, ConfigError};
use billing_core::connection::ConnectionTarget;
use billing_postgres::PoolSettings;
use billing_redpanda::RedpandaOrderQueue;
use billing_runtime::{ConsumerConfig, RetryPolicy};
use std::net::SocketAddr;
use std::time::Duration;

/// Environment keys read by [`AppConfig::from_lookup`] on top of the connection keys
/// in [`billing_core::connection::keys`].
pub mod keys {
    /// Pool size
    pub const MAX_CONNECTIONS: &str = "BILLING_DB_MAX_CONNECTIONS";
    /// Seconds to wait for a pooled connection
    pub const ACQUIRE_TIMEOUT_SECS: &str = "BILLING_DB_ACQUIRE_TIMEOUT_SECS";
    /// Failed readiness checks tolerated after the first one
    pub const READINESS_RETRIES: &str = "BILLING_READINESS_RETRIES";
    /// Seconds between readiness probes
    pub const READINESS_DELAY_SECS: &str = "BILLING_READINESS_DELAY_SECS";
    /// Comma-separated broker list
    pub const QUEUE_BROKERS: &str = "BILLING_QUEUE_BROKERS";
    /// Order topic
    pub const QUEUE_TOPIC: &str = "BILLING_QUEUE_TOPIC";
    /// Consumer group
    pub const QUEUE_GROUP: &str = "BILLING_QUEUE_GROUP";
    /// `earliest` or `latest`
    pub const QUEUE_OFFSET_RESET: &str = "BILLING_QUEUE_OFFSET_RESET";
    /// Attempts to reopen a lost subscription
    pub const RESUBSCRIBE_ATTEMPTS: &str = "BILLING_RESUBSCRIBE_ATTEMPTS";
    /// Prometheus listen address
    pub const METRICS_ADDR: &str = "BILLING_METRICS_ADDR";
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Order store connection
    pub database: DatabaseConfig,
    /// Order queue connection
    pub queue: QueueConfig,
    /// Startup probe budget
    pub readiness: RetryPolicy,
    /// Consumer retry timing
    pub consumer: ConsumerConfig,
    /// Where to serve Prometheus metrics, if anywhere
    pub metrics_addr: Option<SocketAddr>,
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Host, port, credentials and database name
    pub target: ConnectionTarget,
    /// Pool sizing
    pub pool: PoolSettings,
}

/// Redpanda/Kafka configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Topic carrying order events
    pub topic: String,
    /// Consumer group shared by all replicas
    pub consumer_group: String,
    /// Start position for a group without committed offsets
    pub auto_offset_reset: String,
}

impl QueueConfig {
    /// Build the queue adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the adapter rejects the settings.
    pub fn build(&self) -> Result<RedpandaOrderQueue, ConfigError> {
        RedpandaOrderQueue::builder()
            .brokers(&self.brokers)
            .topic(&self.topic)
            .consumer_group(&self.consumer_group)
            .auto_offset_reset(&self.auto_offset_reset)
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: keys::QUEUE_BROKERS.to_string(),
                reason: e.to_string(),
            })
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// See [`AppConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when a database credential is absent and
    /// [`ConfigError::Invalid`] when any value fails to parse or is out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let target = ConnectionTarget::from_lookup(&lookup)?;

        let pool = PoolSettings {
            max_connections: positive(&lookup, keys::MAX_CONNECTIONS, 5)?,
            acquire_timeout: Duration::from_secs(config::parsed_or(
                &lookup,
                keys::ACQUIRE_TIMEOUT_SECS,
                5,
            )?),
        };

        let readiness = RetryPolicy::with_retries(
            config::parsed_or(&lookup, keys::READINESS_RETRIES, RetryPolicy::READINESS_RETRIES)?,
            Duration::from_secs(config::parsed_or(
                &lookup,
                keys::READINESS_DELAY_SECS,
                RetryPolicy::READINESS_DELAY.as_secs(),
            )?),
        );

        let queue = QueueConfig {
            brokers: or_default(&lookup, keys::QUEUE_BROKERS, "billing-queue:9092"),
            topic: or_default(&lookup, keys::QUEUE_TOPIC, "billing_queue"),
            consumer_group: or_default(&lookup, keys::QUEUE_GROUP, "billing-app"),
            auto_offset_reset: offset_reset(&lookup)?,
        };

        let consumer = ConsumerConfig::default()
            .with_resubscribe_attempts(positive(&lookup, keys::RESUBSCRIBE_ATTEMPTS, 10)?);

        let metrics_addr = config::optional(&lookup, keys::METRICS_ADDR)
            .map(|raw| {
                raw.trim().parse().map_err(|e| ConfigError::Invalid {
                    key: keys::METRICS_ADDR.to_string(),
                    reason: format!("{raw:?}: {e}"),
                })
            })
            .transpose()?;

        Ok(Self {
            database: DatabaseConfig { target, pool },
            queue,
            readiness,
            consumer,
            metrics_addr,
        })
    }
}

fn or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    config::optional(lookup, key).unwrap_or_else(|| default.to_string())
}

/// A count that must be at least one.
fn positive<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + From<u8>,
    T::Err: std::fmt::Display,
{
    let value = config::parsed_or(lookup, key, default)?;
    if value < T::from(1) {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

fn offset_reset<F>(lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = or_default(lookup, keys::QUEUE_OFFSET_RESET, "earliest");
    match value.as_str() {
        "earliest" | "latest" => Ok(value),
        other => Err(ConfigError::Invalid {
            key: keys::QUEUE_OFFSET_RESET.to_string(),
            reason: format!("{other:?}: expected \"earliest\" or \"latest\""),
        }),
    }
}
