//! Client trait for the wide-column store.
//!
//! Defines the interface every store transport implements, enabling
//! pluggable storage (managed service, local redb, memory, etc.).

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::error::StoreError;
use super::types::{ReservedThroughput, Row, RowValue, TableOptions, TableSchema};

/// Handle on a single table of the wide-column store.
///
/// All clients must be thread-safe (`Send + Sync`) for use with tokio.
/// Every method maps to one remote call, or to a bounded number of batch
/// calls for the `_multi` variants. Nothing is retried internally.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Name of the table this client reads and writes.
    fn table_name(&self) -> &str;

    /// Writes a row, replacing any existing one.
    ///
    /// If `ttl` is `Some` and the table has native expiry enabled, the store
    /// reclaims the row once `ttl` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails.
    async fn put(&self, id: &str, value: RowValue, ttl: Option<Duration>)
    -> Result<(), StoreError>;

    /// Reads a row.
    ///
    /// Returns `Ok(None)` if there is no such row.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails.
    async fn get(&self, id: &str) -> Result<Option<Row>, StoreError>;

    /// Reads many rows. Ids without a row are absent from the result.
    ///
    /// # Errors
    ///
    /// Returns an error if a remote call, or the read of any single row,
    /// fails.
    async fn get_multi(&self, ids: &[String]) -> Result<HashMap<String, Row>, StoreError>;

    /// Deletes a row. Deleting a missing row succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Deletes many rows, best effort.
    ///
    /// Rows that were deleted stay deleted even if others fail, so the call
    /// can be repeated safely.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BatchFailed`] naming every id that was not
    /// deleted, or another error if a remote call fails outright.
    async fn delete_multi(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Returns the current definition of the table, or `None` if it does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails.
    async fn describe_table(&self) -> Result<Option<TableSchema>, StoreError>;

    /// Creates the table.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails or the table exists.
    async fn create_table(&self, schema: &TableSchema) -> Result<(), StoreError>;

    /// Updates table options and/or reserved throughput.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails.
    async fn update_table(
        &self,
        options: Option<TableOptions>,
        reserved_throughput: Option<ReservedThroughput>,
    ) -> Result<(), StoreError>;

    /// Deletes the table and every row in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails.
    async fn drop_table(&self) -> Result<(), StoreError>;

    /// Creates the table if absent, otherwise reconciles its options and
    /// reserved throughput with `schema`. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SchemaMismatch`] if the existing table is keyed
    /// differently, or an error if a remote call fails.
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let Some(existing) = self.describe_table().await? else {
            self.create_table(schema).await?;
            info!(table = %schema.name, "Table has been created");
            return Ok(());
        };

        if existing.primary_key != schema.primary_key {
            return Err(StoreError::SchemaMismatch {
                table: schema.name.clone(),
                expected: format!("{:?}", schema.primary_key),
                actual: format!("{:?}", existing.primary_key),
            });
        }

        if existing.options != schema.options {
            self.update_table(Some(schema.options), None).await?;
            info!(
                table = %schema.name,
                ttl_seconds = schema.options.ttl_seconds(),
                "Table options have been updated"
            );
        }

        if existing.reserved_throughput != schema.reserved_throughput {
            self.update_table(None, Some(schema.reserved_throughput))
                .await?;
            info!(
                table = %schema.name,
                read = schema.reserved_throughput.read,
                write = schema.reserved_throughput.write,
                "Table reserved throughput has been updated"
            );
        }

        debug!(table = %schema.name, "Table is up to date");
        Ok(())
    }
}
