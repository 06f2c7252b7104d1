//! Error types for the store module.

use authdb_core::{CodecError, CoreError, KeyHash, NodeId};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// A log key failed to decode. The log is corrupt.
    #[error("corrupt replication log entry: {0}")]
    Codec(#[from] CodecError),

    /// No record for the key hash.
    #[error("record not found: {0}")]
    NotFound(KeyHash),

    /// `put` for a key hash that already has a record.
    #[error("record already exists: {0}")]
    AlreadyExists(KeyHash),

    /// Another transaction held the write lock. Retry with backoff.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// A log entry arrived for a key with no local or remote record.
    #[error("no record available to merge for {0}")]
    MissingRecord(KeyHash),

    /// The database belongs to a different node.
    #[error("database belongs to node {stored}, opened as {requested}")]
    IdentityMismatch { stored: NodeId, requested: NodeId },

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Filesystem error around the database file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    TaskJoin(String),
}

impl StoreError {
    /// Whether retrying the operation may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::Conflict(err.to_string())
            }
            _ => Self::Database(err),
        }
    }
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        Self::InvalidData(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
