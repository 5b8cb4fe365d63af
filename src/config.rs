//! Configuration for the node storage backend.
//!
//! [`NodeStoreConfig`] is read once when the backend is built and never
//! reloaded. It can be assembled in code or loaded from a TOML file:
//!
//! ```toml
//! end_point = "https://nodestore-gateway.internal:8443"
//! instance = "sentry"
//! table = "nodestore"
//! access_key_id = "LTAI..."
//! access_key_secret = "..."
//! default_ttl = "30d"
//! automatic_expiry = true
//! compression = "zstd"
//!
//! [reserved_throughput]
//! read = 0
//! write = 0
//! ```

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::Compression;
use crate::store::ReservedThroughput;

const DEFAULT_INSTANCE: &str = "sentry";
const DEFAULT_TABLE: &str = "nodestore";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Invalid configuration detected at construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required option '{0}'")]
    Missing(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Backend configuration.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeStoreConfig {
    /// Service endpoint. `http(s)://` for the managed service,
    /// `redb://<path>` for a local file, `memory://` for an in-process store.
    #[serde(default)]
    pub end_point: String,

    #[serde(default = "default_instance")]
    pub instance: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default)]
    pub access_key_id: String,

    #[serde(default)]
    pub access_key_secret: String,

    /// How long nodes stay readable. `None` keeps them forever.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub default_ttl: Option<Duration>,

    /// Let the store reclaim expired rows natively instead of relying only
    /// on the read-side check.
    #[serde(default)]
    pub automatic_expiry: bool,

    /// Make deletes no-ops and leave expired rows to the store's native
    /// expiry. Only takes effect together with `automatic_expiry`.
    #[serde(default)]
    pub skip_deletes: bool,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default)]
    pub reserved_throughput: ReservedThroughput,

    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
}

fn default_instance() -> String {
    DEFAULT_INSTANCE.to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

impl fmt::Debug for NodeStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStoreConfig")
            .field("end_point", &self.end_point)
            .field("instance", &self.instance)
            .field("table", &self.table)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("default_ttl", &self.default_ttl)
            .field("automatic_expiry", &self.automatic_expiry)
            .field("skip_deletes", &self.skip_deletes)
            .field("compression", &self.compression)
            .field("reserved_throughput", &self.reserved_throughput)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl NodeStoreConfig {
    /// Creates a configuration with the required options and defaults for
    /// everything else.
    pub fn new(
        end_point: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
    ) -> Self {
        Self {
            end_point: end_point.into(),
            instance: default_instance(),
            table: default_table(),
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            default_ttl: None,
            automatic_expiry: false,
            skip_deletes: false,
            compression: Compression::Off,
            reserved_throughput: ReservedThroughput::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_automatic_expiry(mut self, enabled: bool) -> Self {
        self.automatic_expiry = enabled;
        self
    }

    #[must_use]
    pub fn with_skip_deletes(mut self, enabled: bool) -> Self {
        self.skip_deletes = enabled;
        self
    }

    /// Returns true if deletes should be dropped.
    #[must_use]
    pub fn deletes_skipped(&self) -> bool {
        self.automatic_expiry && self.skip_deletes
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_reserved_throughput(mut self, throughput: ReservedThroughput) -> Self {
        self.reserved_throughput = throughput;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Load configuration from a TOML file.
    ///
    /// The result is not validated; call [`validate`](Self::validate) or
    /// hand it to the backend constructor, which does.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML
    /// for this structure.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `end_point`, `access_key_id` or `access_key_secret` is empty
    /// - `instance` or `table` is empty
    /// - `default_ttl` is under one second or not a whole number of seconds
    /// - `request_timeout` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.end_point.trim().is_empty() {
            return Err(ConfigError::Missing("end_point"));
        }
        if self.access_key_id.trim().is_empty() {
            return Err(ConfigError::Missing("access_key_id"));
        }
        if self.access_key_secret.is_empty() {
            return Err(ConfigError::Missing("access_key_secret"));
        }
        if self.instance.trim().is_empty() {
            return Err(ConfigError::invalid("instance", "cannot be empty"));
        }
        if self.table.trim().is_empty() {
            return Err(ConfigError::invalid("table", "cannot be empty"));
        }
        if self.default_ttl.is_some_and(|ttl| ttl.as_secs() == 0) {
            return Err(ConfigError::invalid(
                "default_ttl",
                "must be at least one second; omit it to keep nodes forever",
            ));
        }
        if self.default_ttl.is_some_and(|ttl| ttl.subsec_nanos() != 0) {
            return Err(ConfigError::invalid(
                "default_ttl",
                "must be a whole number of seconds",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("request_timeout", "cannot be zero"));
        }
        Ok(())
    }
}

/// Parse a duration written as whole seconds or with a unit suffix
/// (`s`, `m`, `h`, `d`, `w`).
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{input}' is not a duration (e.g. 3600, 45s, 90m, 12h, 30d)"))?;

    let multiplier = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        other => return Err(format!("unknown duration unit '{other}' in '{input}'")),
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{input}' is too large"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Seconds(u64),
    Text(String),
}

impl DurationRepr {
    fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            Self::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Self::Text(text) => parse_duration(&text).map_err(E::custom),
        }
    }
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    DurationRepr::deserialize(deserializer)?.into_duration()
}

fn deserialize_opt_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<DurationRepr>::deserialize(deserializer)?
        .map(DurationRepr::into_duration)
        .transpose()
}
