//! Process signals and the shutdown flag.
//!
//! SIGINT (Ctrl+C) and SIGTERM both request a graceful stop: the consumer stops
//! receiving, finishes the message it is holding, and the process exits 0.

use std::future::Future;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Resolve when the process receives Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires; the other one
/// still works.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Raise the shutdown flag once `signal` resolves.
pub async fn stop_on<F>(signal: F, stop: watch::Sender<bool>)
where
    F: Future<Output = ()>,
{
    signal.await;
    info!("Shutdown requested, finishing in-flight work");
    stop.send_replace(true);
}
