//! Node storage backend for error-tracking event payloads, on a wide-column
//! store.
//!
//! Nodes are opaque byte blobs addressed by a caller-chosen id. The backend
//! stores each node as one row, optionally compressed, with lazy or native
//! TTL expiry.
//!
//! - [`backend`] - the [`NodeStore`] facade
//! - [`codec`] - payload compression and the per-row marker
//! - [`store`] - wide-column store clients (managed service, redb, memory)
//! - [`config`] - backend configuration
//! - [`error`] - error kinds
//! - [`logging`] - subscriber setup for binaries

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;

pub use backend::NodeStore;
pub use codec::{Codec, Compression, DecodeError};
pub use config::{ConfigError, NodeStoreConfig};
pub use error::{Error, Result};
pub use store::{
    HttpStore, MemoryStore, RedbStore, ReservedThroughput, StoreClient, StoreError, TableSchema,
};
