//! Error types for the node API.

use authdb_core::KeyHash;
use authdb_store::StoreError;
use authdb_sync::SyncError;
use thiserror::Error;

/// Errors returned by [`Node`](crate::Node) operations.
///
/// The front end handles `NotFound`, `AlreadyExists` and `Conflict`; the
/// remaining variants are faults.
#[derive(Debug, Error)]
pub enum NodeError {
    /// No record for this key hash.
    #[error("record not found: {0}")]
    NotFound(KeyHash),

    /// A record already exists for this key hash.
    #[error("record already exists: {0}")]
    AlreadyExists(KeyHash),

    /// Write conflict that outlasted the retry policy.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(StoreError),

    /// Replication error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// A replication task panicked or was aborted.
    #[error("replication task failed: {0}")]
    TaskJoin(String),
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key_hash) => NodeError::NotFound(key_hash),
            StoreError::AlreadyExists(key_hash) => NodeError::AlreadyExists(key_hash),
            StoreError::Conflict(reason) => NodeError::Conflict(reason),
            other => NodeError::Store(other),
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_api_errors() {
        let key_hash = KeyHash::from_bytes([4; 32]);
        assert!(matches!(
            NodeError::from(StoreError::NotFound(key_hash)),
            NodeError::NotFound(k) if k == key_hash
        ));
        assert!(matches!(
            NodeError::from(StoreError::AlreadyExists(key_hash)),
            NodeError::AlreadyExists(_)
        ));
        assert!(matches!(
            NodeError::from(StoreError::Conflict("busy".into())),
            NodeError::Conflict(_)
        ));
        assert!(matches!(
            NodeError::from(StoreError::InvalidData("bad".into())),
            NodeError::Store(_)
        ));
    }
}
