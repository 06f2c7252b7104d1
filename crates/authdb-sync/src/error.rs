//! Error types for the sync module.

use authdb_core::NodeId;
use authdb_store::StoreError;
use thiserror::Error;

use crate::messages::PeerErrorCode;

/// Errors that can occur during replication.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: local={local}: {message}")]
    VersionMismatch { local: u8, message: String },

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error, for transports other than the memory one.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer could not be reached.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(NodeId),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Peer answered with an error.
    #[error("peer error ({code:?}): {message}")]
    PeerError { code: PeerErrorCode, message: String },

    /// A message failed to encode or decode.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
