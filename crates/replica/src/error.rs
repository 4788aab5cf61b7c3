//! Error types for replicas.

use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by fetchers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when reading or writing a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored value could not be encoded or decoded.
    #[error("storage JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by a replica.
///
/// Cloneable so that one terminal error can be delivered to every observer
/// and every waiting `get_data` caller.
#[derive(Debug, Clone, Error)]
pub enum ReplicaError {
    /// The fetcher failed.
    #[error("fetch failed: {0}")]
    Fetch(Arc<dyn std::error::Error + Send + Sync>),

    /// Writing to or removing from storage failed.
    #[error("storage failed: {0}")]
    Storage(Arc<StorageError>),

    /// The load was canceled before it produced a value.
    #[error("loading was canceled")]
    Canceled,

    /// The replica's processing task has stopped.
    #[error("replica is closed")]
    Closed,

    /// A keyed view was asked for data while it has no current key.
    #[error("no key is selected")]
    NoKey,
}

impl ReplicaError {
    /// Wrap a fetcher error.
    pub fn fetch(err: BoxError) -> Self {
        ReplicaError::Fetch(Arc::from(err))
    }

    /// Returns true if this error represents cancellation rather than failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ReplicaError::Canceled)
    }
}

impl From<StorageError> for ReplicaError {
    fn from(err: StorageError) -> Self {
        ReplicaError::Storage(Arc::new(err))
    }
}

/// Errors from [`ReplicaClient`](crate::ReplicaClient) bookkeeping.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A replica with this name exists but holds a different value type.
    #[error("replica '{name}' already exists with a different value type")]
    TypeMismatch { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = ReplicaError::fetch("connection reset".into());
        assert_eq!(err.to_string(), "fetch failed: connection reset");
    }

    #[test]
    fn test_storage_error_converts() {
        let err: ReplicaError = StorageError::Backend("disk full".to_string()).into();
        assert!(matches!(err, ReplicaError::Storage(_)));
        assert_eq!(
            err.to_string(),
            "storage failed: storage backend error: disk full"
        );
    }

    #[test]
    fn test_is_canceled() {
        assert!(ReplicaError::Canceled.is_canceled());
        assert!(!ReplicaError::Closed.is_canceled());
    }
}
