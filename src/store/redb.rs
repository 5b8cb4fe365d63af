//! Redb-backed store client.
//!
//! Emulates the remote service on a local redb file with ACID guarantees,
//! for development and single-host deployments. Table definitions live in
//! a metadata table; each node table is its own redb table of JSON rows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::client::StoreClient;
use super::error::StoreError;
use super::types::{ReservedThroughput, Row, RowValue, TableOptions, TableSchema};

/// Table definitions keyed by table name
const TABLES_META: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("__tables");

/// Row persisted as JSON with its write time and native expiration.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    value: RowValue,
    written_at: DateTime<Utc>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl StoredRow {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// Redb-backed store client.
///
/// `RedbStore` is `Clone` and can be shared across threads. The underlying
/// database handles concurrent access safely.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    table: Arc<str>,
}

impl RedbStore {
    /// Opens or creates a redb database at the given path and returns a
    /// client for `table` inside it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Parent directory cannot be created
    /// - Database file cannot be opened or created (permissions, disk full, etc.)
    /// - Initialization transaction fails to begin or commit
    pub fn open<P: AsRef<Path>>(path: P, table: impl Into<String>) -> Result<Self, StoreError> {
        Self::open_sync(path.as_ref(), table.into()).map_err(StoreError::local)
    }

    fn open_sync(path: &Path, table: String) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
        }

        let db = Database::create(path)
            .with_context(|| format!("Failed to open store database: {}", path.display()))?;

        // Initialize metadata table on first open to ensure it exists for reads
        let write_txn = db
            .begin_write()
            .context("Failed to begin initialization transaction")?;
        {
            let _meta = write_txn
                .open_table(TABLES_META)
                .context("Failed to initialize metadata table")?;
        }
        write_txn
            .commit()
            .context("Failed to commit initialization transaction")?;

        Ok(Self {
            db: Arc::new(db),
            table: Arc::from(table),
        })
    }

    fn rows_table(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    fn schema_sync(&self) -> Result<Option<TableSchema>> {
        let read_txn = self
            .db
            .begin_read()
            .context("Failed to begin read transaction")?;
        let meta = read_txn
            .open_table(TABLES_META)
            .context("Failed to open metadata table")?;

        match meta
            .get(&*self.table)
            .context("Failed to read table definition")?
        {
            Some(guard) => {
                let schema = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize table definition")?;
                Ok(Some(schema))
            },
            None => Ok(None),
        }
    }

    fn require_options(&self) -> Result<TableOptions, StoreError> {
        self.schema_sync()
            .map_err(StoreError::local)?
            .map(|schema| schema.options)
            .ok_or_else(|| StoreError::TableNotFound(self.table.to_string()))
    }

    fn write_schema_sync(&self, schema: &TableSchema) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin write transaction")?;
        {
            let mut meta = write_txn
                .open_table(TABLES_META)
                .context("Failed to open metadata table")?;
            let json =
                serde_json::to_vec(schema).context("Failed to serialize table definition")?;
            meta.insert(&*self.table, json.as_slice())
                .context("Failed to store table definition")?;

            // Create the rows table eagerly so reads never race its creation
            let _rows = write_txn
                .open_table(self.rows_table())
                .context("Failed to create rows table")?;
        }
        write_txn
            .commit()
            .context("Failed to commit table definition")?;
        Ok(())
    }

    fn put_sync(&self, id: &str, value: RowValue, ttl: Option<Duration>) -> Result<(), StoreError> {
        let options = self.require_options()?;

        let written_at = Utc::now();
        let expires_at = ttl
            .filter(|_| options.time_to_live.is_some())
            .and_then(|ttl| chrono::TimeDelta::from_std(ttl).ok())
            .and_then(|ttl| written_at.checked_add_signed(ttl));
        let row = StoredRow {
            value,
            written_at,
            expires_at,
        };

        let write = || -> Result<()> {
            let json = serde_json::to_vec(&row).context("Failed to serialize row to JSON")?;
            let write_txn = self
                .db
                .begin_write()
                .context("Failed to begin write transaction")?;
            {
                let mut table = write_txn
                    .open_table(self.rows_table())
                    .context("Failed to open rows table")?;
                table
                    .insert(id, json.as_slice())
                    .with_context(|| format!("Failed to insert row '{id}'"))?;
            }
            write_txn
                .commit()
                .context("Failed to commit put transaction")?;
            Ok(())
        };

        write().map_err(StoreError::local)
    }

    /// Reads rows, reclaiming any that have expired.
    fn get_many_sync(&self, ids: &[String]) -> Result<HashMap<String, Row>, StoreError> {
        self.require_options()?;

        let read = || -> Result<(HashMap<String, Row>, Vec<String>)> {
            let read_txn = self
                .db
                .begin_read()
                .context("Failed to begin read transaction")?;
            let table = match read_txn.open_table(self.rows_table()) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok((HashMap::new(), Vec::new())),
                Err(e) => return Err(e).context("Failed to open rows table"),
            };

            let now = Utc::now();
            let mut rows = HashMap::with_capacity(ids.len());
            let mut expired = Vec::new();

            for id in ids {
                let Some(guard) = table
                    .get(id.as_str())
                    .with_context(|| format!("Failed to read row '{id}'"))?
                else {
                    continue;
                };
                let stored: StoredRow = serde_json::from_slice(guard.value())
                    .with_context(|| format!("Failed to deserialize row '{id}'"))?;

                if stored.is_expired(now) {
                    expired.push(id.clone());
                } else {
                    rows.insert(
                        id.clone(),
                        Row {
                            value: stored.value,
                            written_at: stored.written_at,
                        },
                    );
                }
            }
            Ok((rows, expired))
        };

        let (rows, expired) = read().map_err(StoreError::local)?;

        // Reclaim expired rows (read transaction already dropped)
        if !expired.is_empty()
            && let Err(e) = self.reclaim_expired_sync(&expired)
        {
            debug!(error = %format!("{e:#}"), "Failed to reclaim expired rows");
        }

        Ok(rows)
    }

    /// Removes rows that are still expired when the write transaction sees
    /// them. A row rewritten since the read is left alone.
    fn reclaim_expired_sync(&self, ids: &[String]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin reclaim transaction")?;
        {
            let mut table = write_txn
                .open_table(self.rows_table())
                .context("Failed to open rows table")?;
            let now = Utc::now();

            for id in ids {
                let expired = match table
                    .get(id.as_str())
                    .with_context(|| format!("Failed to read row '{id}'"))?
                {
                    Some(guard) => serde_json::from_slice::<StoredRow>(guard.value())
                        .with_context(|| format!("Failed to deserialize row '{id}'"))?
                        .is_expired(now),
                    None => false,
                };
                if expired {
                    table
                        .remove(id.as_str())
                        .with_context(|| format!("Failed to remove row '{id}'"))?;
                }
            }
        }
        write_txn
            .commit()
            .context("Failed to commit reclaim transaction")?;
        Ok(())
    }

    fn delete_many_sync(&self, ids: &[String]) -> Result<(), StoreError> {
        self.require_options()?;

        let delete = || -> Result<()> {
            let write_txn = self
                .db
                .begin_write()
                .context("Failed to begin write transaction")?;
            {
                let mut table = write_txn
                    .open_table(self.rows_table())
                    .context("Failed to open rows table")?;
                for id in ids {
                    table
                        .remove(id.as_str())
                        .with_context(|| format!("Failed to remove row '{id}'"))?;
                }
            }
            write_txn
                .commit()
                .context("Failed to commit delete transaction")?;
            Ok(())
        };

        delete().map_err(StoreError::local)
    }

    fn create_sync(&self, schema: &TableSchema) -> Result<(), StoreError> {
        if self.schema_sync().map_err(StoreError::local)?.is_some() {
            return Err(StoreError::service(
                "OTSObjectAlreadyExist",
                format!("table '{}' already exists", self.table),
            ));
        }
        self.write_schema_sync(schema).map_err(StoreError::local)
    }

    fn update_sync(
        &self,
        options: Option<TableOptions>,
        reserved_throughput: Option<ReservedThroughput>,
    ) -> Result<(), StoreError> {
        let mut schema = self
            .schema_sync()
            .map_err(StoreError::local)?
            .ok_or_else(|| StoreError::TableNotFound(self.table.to_string()))?;

        if let Some(options) = options {
            schema.options = options;
        }
        if let Some(throughput) = reserved_throughput {
            schema.reserved_throughput = throughput;
        }
        self.write_schema_sync(&schema).map_err(StoreError::local)
    }

    fn drop_sync(&self) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin write transaction")?;
        {
            let mut meta = write_txn
                .open_table(TABLES_META)
                .context("Failed to open metadata table")?;
            meta.remove(&*self.table)
                .context("Failed to remove table definition")?;
        }
        write_txn
            .delete_table(self.rows_table())
            .context("Failed to delete rows table")?;
        write_txn
            .commit()
            .context("Failed to commit drop transaction")?;
        Ok(())
    }

    /// Runs a blocking closure on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(RedbStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StoreError::Local(format!("Task join error: {e}")))?
    }
}

#[async_trait]
impl StoreClient for RedbStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn put(
        &self,
        id: &str,
        value: RowValue,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.blocking(move |store| store.put_sync(&id, value, ttl))
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<Row>, StoreError> {
        let id = id.to_string();
        self.blocking(move |store| {
            let mut rows = store.get_many_sync(std::slice::from_ref(&id))?;
            Ok(rows.remove(&id))
        })
        .await
    }

    async fn get_multi(&self, ids: &[String]) -> Result<HashMap<String, Row>, StoreError> {
        let ids = ids.to_vec();
        self.blocking(move |store| store.get_many_sync(&ids)).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let ids = vec![id.to_string()];
        self.blocking(move |store| store.delete_many_sync(&ids))
            .await
    }

    async fn delete_multi(&self, ids: &[String]) -> Result<(), StoreError> {
        // One transaction: either every row is gone or none is.
        let ids = ids.to_vec();
        self.blocking(move |store| store.delete_many_sync(&ids))
            .await
    }

    async fn describe_table(&self) -> Result<Option<TableSchema>, StoreError> {
        self.blocking(|store| store.schema_sync().map_err(StoreError::local))
            .await
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let schema = schema.clone();
        self.blocking(move |store| store.create_sync(&schema))
            .await
    }

    async fn update_table(
        &self,
        options: Option<TableOptions>,
        reserved_throughput: Option<ReservedThroughput>,
    ) -> Result<(), StoreError> {
        self.blocking(move |store| store.update_sync(options, reserved_throughput))
            .await
    }

    async fn drop_table(&self) -> Result<(), StoreError> {
        self.blocking(|store| store.drop_sync().map_err(StoreError::local))
            .await
    }
}
