//! In-memory store client.
//!
//! Emulates one table of the remote service using DashMap for concurrent
//! access: writes need a created table, native expiry follows the table
//! options, and rows carry a server-side write timestamp. Ideal for
//! testing, development, and embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::client::StoreClient;
use super::error::{BatchFailure, StoreError};
use super::types::{ReservedThroughput, Row, RowValue, TableOptions, TableSchema};

const INJECTED_FAILURE_CODE: &str = "OTSInternalServerError";

/// Row stored in the memory table with optional native expiration.
#[derive(Clone)]
struct MemoryRow {
    value: RowValue,
    written_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryRow {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    fn to_row(&self) -> Row {
        Row {
            value: self.value.clone(),
            written_at: self.written_at,
        }
    }
}

#[derive(Default)]
struct Inner {
    schema: RwLock<Option<TableSchema>>,
    rows: DashMap<String, MemoryRow>,
    failing: DashSet<String>,
}

/// In-memory store client.
///
/// Cloning is cheap and every clone sees the same table, so a test can keep
/// a handle for inspection while the backend owns another.
///
/// # Example
///
/// ```ignore
/// use tablestore_nodestore::store::MemoryStore;
///
/// let store = MemoryStore::new("nodestore");
/// store.create_table(&schema).await?;
/// store.put("id", value, None).await?;
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    table: String,
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates a client for `table`. The table itself does not exist until
    /// it is created or bootstrapped.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            inner: Arc::default(),
        }
    }

    /// Returns the number of physical rows, including expired ones not yet
    /// reclaimed.
    pub fn len(&self) -> usize {
        self.inner.rows.len()
    }

    /// Returns true if the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.inner.rows.is_empty()
    }

    /// Makes every call touching `id` fail with a service error until
    /// [`heal`](Self::heal) is called.
    pub fn inject_failure(&self, id: impl Into<String>) {
        self.inner.failing.insert(id.into());
    }

    /// Removes an injected failure.
    pub fn heal(&self, id: &str) {
        self.inner.failing.remove(id);
    }

    /// Shifts a row's write timestamp (and native expiry) into the past, as
    /// if it had been written `age` earlier.
    ///
    /// Returns false if there is no such row.
    pub fn backdate(&self, id: &str, age: Duration) -> bool {
        let Ok(age) = chrono::TimeDelta::from_std(age) else {
            return false;
        };
        match self.inner.rows.get_mut(id) {
            Some(mut row) => {
                row.written_at -= age;
                if let Some(expires_at) = row.expires_at.as_mut() {
                    *expires_at -= age;
                }
                true
            },
            None => false,
        }
    }

    fn check_failure(&self, id: &str) -> Result<(), StoreError> {
        if self.inner.failing.contains(id) {
            return Err(StoreError::service(
                INJECTED_FAILURE_CODE,
                format!("injected failure for row '{id}'"),
            ));
        }
        Ok(())
    }

    fn require_table(&self) -> Result<TableOptions, StoreError> {
        self.inner
            .schema
            .read()
            .as_ref()
            .map(|schema| schema.options)
            .ok_or_else(|| StoreError::TableNotFound(self.table.clone()))
    }

    /// Reads a live row, reclaiming it if it has expired.
    fn read_row(&self, id: &str, now: DateTime<Utc>) -> Option<Row> {
        let entry = self.inner.rows.get(id)?;
        if entry.is_expired(now) {
            drop(entry);
            // Only reclaim if no write replaced the row in between.
            self.inner.rows.remove_if(id, |_, row| row.is_expired(now));
            None
        } else {
            Some(entry.to_row())
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn put(
        &self,
        id: &str,
        value: RowValue,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let options = self.require_table()?;
        self.check_failure(id)?;

        let written_at = Utc::now();
        let expires_at = ttl
            .filter(|_| options.time_to_live.is_some())
            .and_then(|ttl| chrono::TimeDelta::from_std(ttl).ok())
            .and_then(|ttl| written_at.checked_add_signed(ttl));

        self.inner.rows.insert(
            id.to_string(),
            MemoryRow {
                value,
                written_at,
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Row>, StoreError> {
        self.require_table()?;
        self.check_failure(id)?;
        Ok(self.read_row(id, Utc::now()))
    }

    async fn get_multi(&self, ids: &[String]) -> Result<HashMap<String, Row>, StoreError> {
        self.require_table()?;
        let now = Utc::now();

        let mut rows = HashMap::with_capacity(ids.len());
        for id in ids {
            self.check_failure(id)?;
            if let Some(row) = self.read_row(id, now) {
                rows.insert(id.clone(), row);
            }
        }
        Ok(rows)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.require_table()?;
        self.check_failure(id)?;
        self.inner.rows.remove(id);
        Ok(())
    }

    async fn delete_multi(&self, ids: &[String]) -> Result<(), StoreError> {
        self.require_table()?;

        let mut failed = Vec::new();
        for id in ids {
            match self.check_failure(id) {
                Ok(()) => {
                    self.inner.rows.remove(id);
                },
                Err(err) => failed.push(BatchFailure {
                    id: id.clone(),
                    code: INJECTED_FAILURE_CODE.to_string(),
                    message: err.to_string(),
                }),
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(StoreError::BatchFailed { failed })
        }
    }

    async fn describe_table(&self) -> Result<Option<TableSchema>, StoreError> {
        Ok(self.inner.schema.read().clone())
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let mut current = self.inner.schema.write();
        if current.is_some() {
            return Err(StoreError::service(
                "OTSObjectAlreadyExist",
                format!("table '{}' already exists", self.table),
            ));
        }
        *current = Some(schema.clone());
        Ok(())
    }

    async fn update_table(
        &self,
        options: Option<TableOptions>,
        reserved_throughput: Option<ReservedThroughput>,
    ) -> Result<(), StoreError> {
        let mut current = self.inner.schema.write();
        let schema = current
            .as_mut()
            .ok_or_else(|| StoreError::TableNotFound(self.table.clone()))?;

        if let Some(options) = options {
            schema.options = options;
        }
        if let Some(throughput) = reserved_throughput {
            schema.reserved_throughput = throughput;
        }
        Ok(())
    }

    async fn drop_table(&self) -> Result<(), StoreError> {
        *self.inner.schema.write() = None;
        self.inner.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(data: &[u8]) -> RowValue {
        RowValue {
            data: data.to_vec(),
            flags: 0,
        }
    }

    async fn store_with_ttl(ttl: Option<Duration>) -> MemoryStore {
        let store = MemoryStore::new("nodestore");
        store
            .create_table(&TableSchema::nodes(
                "nodestore",
                ttl,
                ReservedThroughput::default(),
            ))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_put_requires_table() {
        let store = MemoryStore::new("nodestore");
        let err = store.put("key", value(b"v"), None).await.unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(name) if name == "nodestore"));
    }

    #[tokio::test]
    async fn test_put_get() {
        let store = store_with_ttl(None).await;

        store.put("key1", value(b"value1"), None).await.unwrap();
        let row = store.get("key1").await.unwrap().unwrap();
        assert_eq!(row.value.data, b"value1");
        assert!(row.written_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = store_with_ttl(None).await;
        assert!(store.get("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store_with_ttl(None).await;

        store.put("key1", value(b"value1"), None).await.unwrap();
        store.delete("key1").await.unwrap();
        store.delete("key1").await.unwrap();
        assert!(store.get("key1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_native_expiry_needs_table_ttl() {
        // Without table-level TTL the per-write ttl is ignored.
        let store = store_with_ttl(None).await;
        store
            .put("kept", value(b"v"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.backdate("kept", Duration::from_secs(60));
        assert!(store.get("kept").await.unwrap().is_some());

        let store = store_with_ttl(Some(Duration::from_secs(1))).await;
        store
            .put("expiring", value(b"v"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(store.get("expiring").await.unwrap().is_some());
        store.backdate("expiring", Duration::from_secs(60));
        assert!(store.get("expiring").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reclaim_keeps_concurrent_write() {
        let store = store_with_ttl(Some(Duration::from_secs(1))).await;

        for round in 0..500 {
            store
                .put("race", value(b"stale"), Some(Duration::from_nanos(1)))
                .await
                .unwrap();

            let reader = tokio::spawn({
                let store = store.clone();
                async move { store.get("race").await }
            });
            let writer = tokio::spawn({
                let store = store.clone();
                async move { store.put("race", value(b"fresh"), None).await }
            });
            reader.await.unwrap().unwrap();
            writer.await.unwrap().unwrap();

            let row = store.get("race").await.unwrap();
            assert_eq!(
                row.map(|row| row.value.data),
                Some(b"fresh".to_vec()),
                "round {round}"
            );
        }
    }

    #[tokio::test]
    async fn test_get_multi_omits_missing() {
        let store = store_with_ttl(None).await;
        store.put("a", value(b"1"), None).await.unwrap();

        let ids = vec!["a".to_string(), "b".to_string()];
        let rows = store.get_multi(&ids).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows["a"].value.data, b"1");
    }

    #[tokio::test]
    async fn test_delete_multi_reports_failures() {
        let store = store_with_ttl(None).await;
        for id in ["a", "b", "c"] {
            store.put(id, value(b"v"), None).await.unwrap();
        }
        store.inject_failure("b");

        let ids: Vec<String> = ["a", "b", "c"].iter().map(ToString::to_string).collect();
        let err = store.delete_multi(&ids).await.unwrap_err();
        let StoreError::BatchFailed { failed } = err else {
            panic!("expected batch failure");
        };
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "b");
        assert_eq!(store.len(), 1);

        store.heal("b");
        store.delete_multi(&ids).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_create_table_twice_fails() {
        let store = store_with_ttl(None).await;
        let err = store
            .create_table(&TableSchema::nodes(
                "nodestore",
                None,
                ReservedThroughput::default(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Service { code, .. } if code == "OTSObjectAlreadyExist"));
    }

    #[tokio::test]
    async fn test_drop_table() {
        let store = store_with_ttl(None).await;
        store.put("a", value(b"v"), None).await.unwrap();

        store.drop_table().await.unwrap();
        assert!(store.describe_table().await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
