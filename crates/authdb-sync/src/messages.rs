//! Peer protocol message types.
//!
//! A replicator sends [`PeerRequest`]s to a peer and gets one
//! [`PeerResponse`] back. Messages travel as CBOR. Log entries travel as
//! their encoded log keys, so a peer decodes them exactly as a local scan
//! would and a malformed entry fails the whole response.

use serde::{Deserialize, Serialize};

use authdb_core::{Clock, KeyHash, NodeId, ReplicationLogEntry, VersionedRecord};

use crate::error::{Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0;

/// Message size limits.
pub mod limits {
    /// Max entries in one `Log` response, and max `ExportLog.limit`.
    pub const MAX_EXPORT_BATCH: usize = 1000;
    /// Max key hashes in one `FetchRecords`, and max records in `Records`.
    pub const MAX_RECORDS_PER_FETCH: usize = 100;
    /// Max length of an error message.
    pub const MAX_ERROR_MESSAGE: usize = 1024;
}

/// Requests a replicator sends to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Entries authored by `node_id` with a clock strictly after `since`.
    ExportLog {
        /// Protocol version for compatibility checking.
        protocol_version: u8,
        /// Author whose entries are requested.
        node_id: NodeId,
        /// The requester's watermark for that author.
        since: Clock,
        /// Max entries to return.
        limit: u32,
    },

    /// The peer's current versions of these records.
    FetchRecords {
        /// Protocol version for compatibility checking.
        protocol_version: u8,
        /// Records to fetch.
        key_hashes: Vec<KeyHash>,
    },
}

/// Responses a peer sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    /// Answer to `ExportLog`, ascending by clock.
    Log { entries: Vec<ReplicationLogEntry> },

    /// Answer to `FetchRecords`. Records the peer does not have are omitted.
    Records { records: Vec<VersionedRecord> },

    /// Error condition.
    Error {
        /// Error code for programmatic handling.
        code: PeerErrorCode,
        /// Human-readable description.
        message: String,
    },
}

/// Error codes for the peer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum PeerErrorCode {
    /// Unknown/unspecified error.
    Unknown = 0,
    /// Protocol version mismatch.
    VersionMismatch = 1,
    /// Message too large.
    MessageTooLarge = 2,
    /// Invalid message format.
    InvalidMessage = 3,
    /// Internal error on peer.
    InternalError = 4,
}

impl PeerRequest {
    /// The protocol version the request was built for.
    pub fn protocol_version(&self) -> u8 {
        match self {
            PeerRequest::ExportLog { protocol_version, .. }
            | PeerRequest::FetchRecords { protocol_version, .. } => *protocol_version,
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            PeerRequest::ExportLog { limit, .. } => {
                if *limit as usize > limits::MAX_EXPORT_BATCH {
                    return Err("export limit too large");
                }
                if *limit == 0 {
                    return Err("export limit is zero");
                }
            }
            PeerRequest::FetchRecords { key_hashes, .. } => {
                if key_hashes.len() > limits::MAX_RECORDS_PER_FETCH {
                    return Err("too many key hashes");
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl PeerResponse {
    /// Build an error response, truncating the message to the size limit.
    pub fn error(code: PeerErrorCode, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > limits::MAX_ERROR_MESSAGE {
            let mut end = limits::MAX_ERROR_MESSAGE;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        PeerResponse::Error { code, message }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            PeerResponse::Log { entries } => {
                if entries.len() > limits::MAX_EXPORT_BATCH {
                    return Err("too many log entries");
                }
            }
            PeerResponse::Records { records } => {
                if records.len() > limits::MAX_RECORDS_PER_FETCH {
                    return Err("too many records");
                }
            }
            PeerResponse::Error { message, .. } => {
                if message.len() > limits::MAX_ERROR_MESSAGE {
                    return Err("error message too long");
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| SyncError::Encoding(e.to_string()))?;
    Ok(buf)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::Encoding(e.to_string()))
}
