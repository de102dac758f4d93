//! Shutdown signalling for long-running tasks.
//!
//! A `watch` channel carries a single flag. The process flips it to `true` on
//! SIGINT/SIGTERM; tasks race [`requested`] against their next unit of work and
//! finish whatever is already in progress.

use tokio::sync::watch;

/// Create a shutdown channel with the flag cleared.
#[must_use]
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown has been requested.
///
/// Returns immediately if the flag is already set. A dropped sender also counts as
/// a request, since nobody is left to clear it.
pub async fn requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
