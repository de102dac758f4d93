//! One-shot schema initialization.

use billing_core::schema::{SchemaDescriptor, TableDefinition};
use billing_core::store::{OrderStore, StoreError};
use thiserror::Error;

/// Schema creation failed. Not retried: it points at misconfiguration or missing
/// privileges rather than a transient outage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Schema initialization failed ({tables} tables requested): {source}")]
pub struct SchemaError {
    /// Tables in the descriptor that was being applied
    pub tables: usize,
    /// Error reported by the store
    pub source: StoreError,
}

/// Create every table in `descriptor` that does not exist yet.
///
/// Safe on every process start: against an initialized database this is a no-op.
///
/// # Errors
///
/// Returns [`SchemaError`] if the store rejects any statement.
pub async fn ensure_schema(
    store: &dyn OrderStore,
    descriptor: &SchemaDescriptor,
) -> Result<(), SchemaError> {
    store
        .ensure_schema(descriptor)
        .await
        .map_err(|source| SchemaError {
            tables: descriptor.len(),
            source,
        })?;

    let tables: Vec<&str> = descriptor.tables().iter().map(TableDefinition::name).collect();
    tracing::info!(table_count = descriptor.len(), tables = ?tables, "Schema ready");
    Ok(())
}
