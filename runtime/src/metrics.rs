//! Prometheus metrics for the ingestion path.
//!
//! Recording goes through the `metrics` facade and is a no-op until a recorder is
//! installed, so library code records unconditionally. The binary installs the
//! Prometheus exporter only when a listen address is configured.
//!
//! # Example
//!
//! ```rust,no_run
//! use billing_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the Prometheus recorder and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime; the listener runs as a spawned
    /// task for the lifetime of the process.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), a warning is logged and
    /// the call succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if let Err(error) = exporter.await {
                        tracing::error!(error = ?error, "Metrics exporter stopped");
                    }
                });
                register_metrics();
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the listener was configured with.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "billing_readiness_attempts_total",
        "Database readiness probes executed at startup"
    );

    describe_counter!(
        "billing_orders_stored_total",
        "Orders committed to the billing store"
    );
    describe_counter!(
        "billing_orders_duplicate_total",
        "Deliveries whose order identifier was already stored"
    );
    describe_counter!(
        "billing_orders_poisoned_total",
        "Deliveries acknowledged without storage because the payload was malformed"
    );
    describe_counter!(
        "billing_orders_deferred_total",
        "Deliveries released for redelivery after a persistence failure"
    );
    describe_counter!(
        "billing_queue_resubscriptions_total",
        "Subscriptions reopened after the queue connection was lost"
    );
    describe_histogram!(
        "billing_store_upsert_duration_seconds",
        "Time taken by the transactional order upsert"
    );

    describe_counter!("retry_attempts_total", "Total number of retried operation attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("retry_exhausted_total", "Operations that ran out of attempts");
}

/// Readiness probe metrics recorder.
pub struct ReadinessMetrics;

impl ReadinessMetrics {
    /// Record one probe.
    pub fn record_attempt() {
        counter!("billing_readiness_attempts_total").increment(1);
    }
}

/// Consumer loop metrics recorder.
pub struct IngestMetrics;

impl IngestMetrics {
    /// Record a newly committed order.
    pub fn record_stored(duration: Duration) {
        counter!("billing_orders_stored_total").increment(1);
        histogram!("billing_store_upsert_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a delivery whose order already existed.
    pub fn record_duplicate(duration: Duration) {
        counter!("billing_orders_duplicate_total").increment(1);
        histogram!("billing_store_upsert_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a malformed delivery.
    pub fn record_poisoned() {
        counter!("billing_orders_poisoned_total").increment(1);
    }

    /// Record a delivery released after a persistence failure.
    pub fn record_deferred() {
        counter!("billing_orders_deferred_total").increment(1);
    }

    /// Record a reopened subscription.
    pub fn record_resubscription() {
        counter!("billing_queue_resubscriptions_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record an attempt of a retried operation.
    pub fn record_attempt(operation: &str) {
        counter!("retry_attempts_total", "operation" => operation.to_string()).increment(1);
    }

    /// Record an operation that succeeded after at least one failure.
    pub fn record_success(operation: &str) {
        counter!("retry_successes_total", "operation" => operation.to_string()).increment(1);
    }

    /// Record an operation that ran out of attempts.
    pub fn record_exhausted(operation: &str) {
        counter!("retry_exhausted_total", "operation" => operation.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_metrics_server_renders_ingest_counters() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        IngestMetrics::record_stored(Duration::from_millis(3));
        IngestMetrics::record_poisoned();
        ReadinessMetrics::record_attempt();

        // handle is None if another test already installed the recorder
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("billing_orders_stored_total"));
            assert!(rendered.contains("billing_orders_poisoned_total"));
            assert!(rendered.contains("billing_readiness_attempts_total"));
        }
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        IngestMetrics::record_deferred();
        IngestMetrics::record_resubscription();
        RetryMetrics::record_attempt("test");
    }
}
