//! Node storage backend.
//!
//! [`NodeStore`] is the contract the host application depends on. It owns
//! the configuration, encodes payloads, applies the TTL policy and forwards
//! each call to a [`StoreClient`].
//!
//! # Example
//!
//! ```ignore
//! use tablestore_nodestore::{Compression, NodeStore, NodeStoreConfig};
//! use std::time::Duration;
//!
//! let config = NodeStoreConfig::new("https://nodestore-gateway.internal:8443", id, secret)
//!     .with_default_ttl(Duration::from_secs(30 * 86_400))
//!     .with_compression(Compression::Zstd);
//!
//! let nodes = NodeStore::from_config(config)?;
//! nodes.bootstrap().await?;
//!
//! nodes.set("event:1", b"payload").await?;
//! assert_eq!(nodes.get("event:1").await?, Some(b"payload".to_vec()));
//! ```


use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, debug, debug_span};

use crate::codec::Codec;
use crate::config::{ConfigError, NodeStoreConfig};
use crate::error::{Error, Result};
use crate::store::{
    HttpStore, MAX_VALUE_SIZE, MemoryStore, RedbStore, Row, RowValue, StoreClient, TableSchema,
};

const MEMORY_SCHEME: &str = "memory://";
const REDB_SCHEME: &str = "redb://";

/// Node storage backend.
///
/// # Thread Safety
///
/// `NodeStore` is `Clone` and can be shared across tasks. It holds nothing
/// but its immutable configuration and the store client, so concurrent
/// calls never contend inside the backend.
#[derive(Clone)]
pub struct NodeStore {
    config: Arc<NodeStoreConfig>,
    codec: Codec,
    store: Arc<dyn StoreClient>,
    log_sink: Option<Dispatch>,
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("config", &self.config)
            .field("table", &self.store.table_name())
            .finish_non_exhaustive()
    }
}

impl NodeStore {
    /// Creates a backend, choosing the store client from the `end_point`
    /// scheme:
    ///
    /// - `http://` / `https://` - the managed service
    /// - `redb://<path>` - a local redb file
    /// - `memory://` - an in-process store
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid, or
    /// [`Error::Store`] if a local store cannot be opened.
    pub fn from_config(config: NodeStoreConfig) -> Result<Self> {
        config.validate()?;

        let end_point = config.end_point.trim();
        let store: Arc<dyn StoreClient> = if end_point.starts_with(MEMORY_SCHEME) {
            Arc::new(MemoryStore::new(config.table.clone()))
        } else if let Some(path) = end_point.strip_prefix(REDB_SCHEME) {
            if path.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "end_point",
                    reason: "redb:// needs a file path".to_string(),
                }
                .into());
            }
            Arc::new(RedbStore::open(path, config.table.clone())?)
        } else {
            Arc::new(HttpStore::new(&config)?)
        };

        Self::from_arc(config, store)
    }

    /// Creates a backend over a custom store client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn with_store<S: StoreClient>(config: NodeStoreConfig, store: S) -> Result<Self> {
        Self::from_arc(config, Arc::new(store))
    }

    /// Creates a backend over a shared store client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn from_arc(config: NodeStoreConfig, store: Arc<dyn StoreClient>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            codec: Codec::new(config.compression),
            config: Arc::new(config),
            store,
            log_sink: None,
        })
    }

    /// Routes this backend's log events to `sink` instead of the global
    /// subscriber.
    #[must_use]
    pub fn with_log_sink(mut self, sink: impl Into<Dispatch>) -> Self {
        self.log_sink = Some(sink.into());
        self
    }

    pub fn config(&self) -> &NodeStoreConfig {
        &self.config
    }

    /// Schema the backing table is bootstrapped with.
    ///
    /// Native expiry is only enabled when `automatic_expiry` is on and a
    /// `default_ttl` is configured.
    pub fn table_schema(&self) -> TableSchema {
        let ttl = self
            .config
            .default_ttl
            .filter(|_| self.config.automatic_expiry);
        TableSchema::nodes(
            self.config.table.clone(),
            ttl,
            self.config.reserved_throughput,
        )
    }

    /// Retrieves a node's data.
    ///
    /// Returns `Ok(None)` if the node does not exist or has outlived
    /// `default_ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store call fails or the row cannot be
    /// decoded.
    pub async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.scoped("get", async {
            match self.store.get(id).await? {
                Some(row) => self.decode_live(id, row),
                None => Ok(None),
            }
        })
        .await
    }

    /// Stores a node, replacing any existing data for `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the store's value limit after
    /// encoding, or the store call fails.
    pub async fn set(&self, id: &str, data: &[u8]) -> Result<()> {
        self.scoped("set", async {
            let encoded = self.codec.encode(data).map_err(|source| Error::Encode {
                id: id.to_string(),
                source,
            })?;

            if encoded.payload.len() > MAX_VALUE_SIZE {
                return Err(Error::ValueTooLarge {
                    id: id.to_string(),
                    size: encoded.payload.len(),
                    limit: MAX_VALUE_SIZE,
                });
            }

            self.store
                .put(id, RowValue::from(encoded), self.config.default_ttl)
                .await?;
            Ok(())
        })
        .await
    }

    /// Deletes a node. Deleting a missing node succeeds.
    ///
    /// With `skip_deletes` and automatic expiry both set this does nothing
    /// and the row is left for the store to expire.
    ///
    /// # Errors
    ///
    /// Returns an error if the store call fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.config.deletes_skipped() {
            return Ok(());
        }
        self.scoped("delete", async {
            self.store.delete(id).await?;
            Ok(())
        })
        .await
    }

    /// Retrieves many nodes. Missing or expired ids are absent from the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns an error if a store call fails or any returned row cannot be
    /// decoded.
    pub async fn get_multi(&self, ids: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        self.scoped("get_multi", async {
            let rows = self.store.get_multi(ids).await?;
            let mut nodes = HashMap::with_capacity(rows.len());
            for (id, row) in rows {
                if let Some(data) = self.decode_live(&id, row)? {
                    nodes.insert(id, data);
                }
            }
            debug!(requested = ids.len(), found = nodes.len(), "Fetched nodes");
            Ok(nodes)
        })
        .await
    }

    /// Deletes many nodes, best effort.
    ///
    /// # Errors
    ///
    /// Returns an error naming the ids that were not deleted. Repeating the
    /// call is safe.
    pub async fn delete_multi(&self, ids: &[String]) -> Result<()> {
        if self.config.deletes_skipped() {
            return Ok(());
        }
        match ids {
            [] => Ok(()),
            [id] => self.delete(id).await,
            _ => {
                self.scoped("delete_multi", async {
                    self.store.delete_multi(ids).await?;
                    Ok(())
                })
                .await
            },
        }
    }

    /// Creates the backing table, or reconciles an existing one with the
    /// configured TTL policy and throughput. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be created or updated, or is
    /// keyed differently than a node table.
    pub async fn bootstrap(&self) -> Result<()> {
        let schema = self.table_schema();
        self.scoped("bootstrap", async move {
            self.store.ensure_table(&schema).await?;
            Ok(())
        })
        .await
    }

    /// Deletes the backing table and every node in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store call fails.
    pub async fn destroy(&self) -> Result<()> {
        self.scoped("destroy", async {
            if self.store.describe_table().await?.is_none() {
                tracing::warn!(
                    table = self.store.table_name(),
                    "Table does not exist, skip deleting"
                );
                return Ok(());
            }
            self.store.drop_table().await?;
            tracing::info!(table = self.store.table_name(), "Table has been deleted");
            Ok(())
        })
        .await
    }

    /// Decodes a row unless it has outlived `default_ttl`.
    ///
    /// The check runs even with automatic expiry, since the store reclaims
    /// expired rows eventually rather than at the instant they expire.
    fn decode_live(&self, id: &str, row: Row) -> Result<Option<Vec<u8>>> {
        if let Some(ttl) = self.config.default_ttl
            && row.is_older_than(ttl, Utc::now())
        {
            debug!(id, written_at = %row.written_at, "Node has expired");
            return Ok(None);
        }

        Codec::decode(row.value.flags, &row.value.data)
            .map(Some)
            .map_err(|source| Error::decode(id, source))
    }

    /// Runs an operation inside its span, under the injected log sink if
    /// there is one.
    async fn scoped<T>(&self, op: &'static str, fut: impl Future<Output = T>) -> T {
        match &self.log_sink {
            Some(sink) => {
                let span = tracing::dispatcher::with_default(sink, || {
                    debug_span!("nodestore", op, table = self.store.table_name())
                });
                fut.instrument(span).with_subscriber(sink.clone()).await
            },
            None => {
                fut.instrument(debug_span!(
                    "nodestore",
                    op,
                    table = self.store.table_name()
                ))
                .await
            },
        }
    }
}
