//! Row and table types shared by every store client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::Encoded;

use super::ID_COLUMN;

/// Encoded attributes of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowValue {
    pub data: Vec<u8>,
    /// Compression marker. Zero means the column is not written at all.
    #[serde(default)]
    pub flags: u8,
}

impl From<Encoded> for RowValue {
    fn from(encoded: Encoded) -> Self {
        Self {
            data: encoded.payload,
            flags: encoded.flags,
        }
    }
}

/// A row as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub value: RowValue,
    /// Server-side timestamp of the last write.
    pub written_at: DateTime<Utc>,
}

impl Row {
    /// Returns true if the row is older than `ttl` at `now`.
    #[must_use]
    pub fn is_older_than(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::TimeDelta::from_std(ttl) {
            Ok(ttl) => self
                .written_at
                .checked_add_signed(ttl)
                .is_some_and(|expires_at| expires_at < now),
            // A TTL beyond chrono's range never elapses.
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrimaryKeyType {
    String,
    Integer,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PrimaryKeyType,
}

/// Table-level options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Native row expiry. `None` disables it (`-1` on the wire).
    pub time_to_live: Option<Duration>,
    pub max_versions: u32,
}

impl TableOptions {
    pub fn new(time_to_live: Option<Duration>) -> Self {
        Self {
            time_to_live,
            max_versions: 1,
        }
    }

    /// TTL in seconds as the service encodes it.
    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.time_to_live
            .map_or(-1, |ttl| i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
    }

    /// Inverse of [`ttl_seconds`](Self::ttl_seconds).
    #[must_use]
    pub fn from_ttl_seconds(seconds: i64, max_versions: u32) -> Self {
        Self {
            time_to_live: u64::try_from(seconds)
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            max_versions,
        }
    }
}

/// Reserved read/write capacity units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReservedThroughput {
    #[serde(default)]
    pub read: u32,
    #[serde(default)]
    pub write: u32,
}

impl ReservedThroughput {
    pub fn new(read: u32, write: u32) -> Self {
        Self { read, write }
    }
}

/// Definition of a node table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: Vec<PrimaryKeyColumn>,
    pub options: TableOptions,
    pub reserved_throughput: ReservedThroughput,
}

impl TableSchema {
    /// Schema of a node table: a single string `id` key.
    pub fn nodes(
        name: impl Into<String>,
        time_to_live: Option<Duration>,
        reserved_throughput: ReservedThroughput,
    ) -> Self {
        Self {
            name: name.into(),
            primary_key: vec![PrimaryKeyColumn {
                name: ID_COLUMN.to_string(),
                kind: PrimaryKeyType::String,
            }],
            options: TableOptions::new(time_to_live),
            reserved_throughput,
        }
    }
}
