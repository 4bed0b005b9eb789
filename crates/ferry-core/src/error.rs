//! Persistence errors.

use std::borrow::Cow;
use thiserror::Error;

/// Errors returned by a [`TransferStore`](crate::store::TransferStore)
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// Requested record does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind ("transfer", "rule", ...)
        kind: &'static str,
        /// Record identifier
        id: i64,
    },

    /// A record with the same identifier already exists
    #[error("{kind} {id} already exists")]
    Duplicate {
        /// Record kind
        kind: &'static str,
        /// Record identifier
        id: i64,
    },

    /// Record failed validation before being written
    #[error("Invalid record: {0}")]
    Invalid(Cow<'static, str>),

    /// Backing file could not be read or written
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Backing file content could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store is not reachable anymore
    #[error("Store unavailable: {0}")]
    Unavailable(Cow<'static, str>),
}

impl StoreError {
    /// Create a not-found error
    #[must_use]
    pub const fn not_found(kind: &'static str, id: i64) -> Self {
        StoreError::NotFound { kind, id }
    }

    /// Create an invalid-record error with static context (zero allocation)
    #[must_use]
    pub const fn invalid(context: &'static str) -> Self {
        StoreError::Invalid(Cow::Borrowed(context))
    }

    /// Create an unavailable error with static context (zero allocation)
    #[must_use]
    pub const fn unavailable(context: &'static str) -> Self {
        StoreError::Unavailable(Cow::Borrowed(context))
    }

    /// Returns true if the store itself is gone, as opposed to a single bad
    /// record. The remote is not notified of such errors.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
