//! Error types for node storage operations.
//!
//! Each failure source keeps its own kind so callers can tell a corrupt
//! row apart from an unreachable store or a bad configuration:
//!
//! - [`DecodeError`] - stored bytes carry an unknown or corrupt marker
//! - [`StoreError`] - anything at the remote-store boundary
//! - [`ConfigError`] - invalid configuration at construction
//!
//! A missing node is not an error: lookups return `Ok(None)`.

pub use crate::codec::DecodeError;
pub use crate::config::ConfigError;
pub use crate::store::StoreError;

/// Result type for node storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Node storage errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A stored row could not be decoded.
    #[error("failed to decode node '{id}': {source}")]
    Decode {
        id: String,
        #[source]
        source: DecodeError,
    },

    /// A payload could not be compressed.
    #[error("failed to encode node '{id}': {source}")]
    Encode {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote store rejected or failed the call.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The backend was constructed with an invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Encoded value exceeds the store's per-value size limit.
    #[error("node '{id}' is {size} bytes after encoding, larger than the {limit} byte limit")]
    ValueTooLarge { id: String, size: usize, limit: usize },
}

impl Error {
    /// Create a decode error for the given node id.
    pub fn decode(id: impl Into<String>, source: DecodeError) -> Self {
        Self::Decode {
            id: id.into(),
            source,
        }
    }

    /// Returns true if retrying the same call may succeed.
    ///
    /// Only transport-level store failures qualify; the backend never
    /// retries on its own, this is a hint for the caller's policy.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Decode { .. }
            | Self::Encode { .. }
            | Self::Config(_)
            | Self::ValueTooLarge { .. } => false,
        }
    }
}
