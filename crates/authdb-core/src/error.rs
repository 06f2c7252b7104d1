//! Error types for authdb core.

use thiserror::Error;

/// Errors constructing or parsing core values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid clock: expected 8 bytes, got {0}")]
    InvalidClock(usize),

    #[error("clock overflow")]
    ClockOverflow,

    #[error("invalid key hash: {0}")]
    InvalidKeyHash(String),

    #[error("unknown record state: {0}")]
    UnknownState(u32),
}

/// Errors decoding a replication log key.
///
/// A decode error means the key is corrupt. Scans that hit one fail instead
/// of skipping the entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("entry too short: {len} bytes, need at least {min}")]
    EntryTooShort { len: usize, min: usize },

    #[error("entry does not start with the replication log prefix")]
    MissingPrefix,

    #[error("expected separator at offset {0}")]
    MissingSeparator(usize),

    #[error("invalid field: {0}")]
    InvalidField(#[from] CoreError),
}
