//! Wide-column store clients.
//!
//! A [`StoreClient`] is a thin handle on one table of the remote store. It
//! moves already-encoded rows in and out and never looks inside them.
//! Three implementations are provided:
//!
//! - **HttpStore**: the managed service, over its signed JSON action API
//! - **RedbStore**: a local single-node emulation on a redb file
//! - **MemoryStore**: an in-process emulation, ideal for tests
//!
//! Implement the trait to plug in another transport:
//!
//! ```ignore
//! use tablestore_nodestore::{NodeStore, NodeStoreConfig, StoreClient};
//!
//! struct GrpcStore { /* ... */ }
//! impl StoreClient for GrpcStore { /* ... */ }
//!
//! let nodes = NodeStore::with_store(config, GrpcStore::new())?;
//! ```

mod client;
mod error;
mod http;
mod memory;
mod redb;
mod signing;
mod types;


pub use client::StoreClient;
pub use error::{BatchFailure, StoreError};
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use redb::RedbStore;
pub use signing::{RequestSigner, SignedHeaders};
pub use types::{
    PrimaryKeyColumn, PrimaryKeyType, ReservedThroughput, Row, RowValue, TableOptions, TableSchema,
};

/// Rows read by one `BatchGetRow` call at most.
pub const BATCH_GET_LIMIT: usize = 100;

/// Rows written by one `BatchWriteRow` call at most.
pub const BATCH_WRITE_LIMIT: usize = 200;

/// Largest attribute value the service accepts (2 MiB).
pub const MAX_VALUE_SIZE: usize = 2 * 1024 * 1024;

/// Primary key column every node table is keyed by.
pub const ID_COLUMN: &str = "id";

/// Attribute column holding the encoded payload.
pub const DATA_COLUMN: &str = "data";

/// Attribute column holding the compression marker.
pub const FLAGS_COLUMN: &str = "flags";
