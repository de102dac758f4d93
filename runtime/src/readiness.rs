//! Database readiness probe.
//!
//! At process start the database may still be booting. [`await_ready`] probes it
//! with a trivial round-trip until one succeeds or the [`RetryPolicy`] runs out. The
//! policy is a value passed in, so tests run the full budget of 90 retries with
//! [`RetryPolicy::immediate`].
//!
//! A ping that never answers (a blackholed host, a stalled TLS handshake) counts
//! as a failure once [`ping_timeout`] elapses.

use crate::metrics::ReadinessMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use billing_core::store::{OrderStore, StoreError};
use std::time::Duration;
use thiserror::Error;

/// Shortest time a single ping is given to answer.
pub const MIN_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// The database never answered within the retry budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Database not ready after {attempts} attempts: {last_error}")]
pub struct Unready {
    /// Probes executed
    pub attempts: usize,
    /// Error returned by the final probe
    #[source]
    pub last_error: StoreError,
}

/// Time a single ping may take before it is abandoned: the policy's delay, but
/// never less than [`MIN_PING_TIMEOUT`].
#[must_use]
pub fn ping_timeout(policy: &RetryPolicy) -> Duration {
    policy.initial_delay.max(MIN_PING_TIMEOUT)
}

/// Longest [`await_ready`] can run under `policy`: every ping times out and every
/// delay is slept.
#[must_use]
pub fn worst_case_wait(policy: &RetryPolicy) -> Duration {
    let pings = u32::try_from(policy.max_attempts.max(1)).unwrap_or(u32::MAX);
    policy
        .total_wait()
        .saturating_add(ping_timeout(policy).saturating_mul(pings))
}

/// Probe `store` until it answers or `policy` is exhausted.
///
/// Each failed probe is logged with its attempt number and swallowed. A ping
/// still pending after [`ping_timeout`] is dropped and counted as failed. Success
/// returns immediately, without waiting out the remaining budget.
///
/// # Errors
///
/// Returns [`Unready`] with the attempt count and the last probe error once every
/// attempt has failed.
pub async fn await_ready(store: &dyn OrderStore, policy: &RetryPolicy) -> Result<(), Unready> {
    let mut attempts = 0_usize;
    let limit = ping_timeout(policy);

    let outcome = retry_with_backoff(policy, "database readiness", || {
        attempts += 1;
        ReadinessMetrics::record_attempt();
        let ping = store.ping();
        async move {
            match tokio::time::timeout(limit, ping).await {
                Ok(answer) => answer,
                Err(_) => Err(StoreError::Unavailable(format!(
                    "no answer within {}ms",
                    limit.as_millis()
                ))),
            }
        }
    })
    .await;

    match outcome {
        Ok(()) => {
            tracing::info!(attempts, "Database ready");
            Ok(())
        }
        Err(last_error) => Err(Unready {
            attempts,
            last_error,
        }),
    }
}
