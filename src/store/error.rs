//! Failures at the remote-store boundary.

use std::fmt;

/// One id that a batch call failed to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    pub code: String,
    pub message: String,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.id, self.code, self.message)
    }
}

/// Any failure reported by, or while talking to, the store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The request never got a response (connect, DNS, TLS, reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport gave up waiting for a response.
    #[error("request timed out")]
    Timeout,

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The service asked us to slow down.
    #[error("throttled by store: {0}")]
    Throttled(String),

    /// The backing table does not exist.
    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    /// The existing table is keyed differently than expected.
    #[error("table '{table}' primary key mismatch: expected {expected}, found {actual}")]
    SchemaMismatch {
        table: String,
        expected: String,
        actual: String,
    },

    /// Some rows of a batch call were not applied.
    #[error("{} of the batch failed: {}", .failed.len(), summarize(.failed))]
    BatchFailed { failed: Vec<BatchFailure> },

    /// The service returned an error.
    #[error("store error {code}: {message}")]
    Service { code: String, message: String },

    /// A local store (redb file) failed.
    #[error("local store error: {0}")]
    Local(String),
}

fn summarize(failed: &[BatchFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl StoreError {
    /// Wrap a local store failure, keeping its context chain.
    pub fn local(err: anyhow::Error) -> Self {
        Self::Local(format!("{err:#}"))
    }

    /// Create a service error.
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns true if the same call may succeed when repeated.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Throttled(_) | Self::BatchFailed { .. } => {
                true
            },
            Self::Auth(_)
            | Self::TableNotFound(_)
            | Self::SchemaMismatch { .. }
            | Self::Service { .. }
            | Self::Local(_) => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}
