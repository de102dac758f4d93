//! `billing-app`: billing order ingestion.
//!
//! Exit codes: 0 after a graceful shutdown, 78 for bad configuration, 69 when the
//! database never became ready, 70 when the schema could not be created, 74 when
//! the order queue was lost.

use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is normal outside development
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting billing ingestion");

    match billing_app::run().await {
        Ok(stats) => {
            info!(
                stored = stats.stored,
                duplicates = stats.duplicates,
                poisoned = stats.poisoned,
                deferred = stats.deferred,
                "Shutdown complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code();
            error!(error = %e, exit_code = code, "Billing ingestion stopped");
            ExitCode::from(code)
        }
    }
}
