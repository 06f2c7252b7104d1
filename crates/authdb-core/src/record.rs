//! The authorization record and its replication versions.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::identity::{Clock, NodeId};
use crate::types::KeyHash;

/// Validity state of a record.
///
/// Encoded as a 4-byte unsigned integer in log keys. States carry a rank;
/// during resolution the highest rank present wins, and terminal states
/// never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum RecordState {
    /// The record exists and authorizes access.
    Created = 0,
    /// The record was revoked. Terminal.
    Invalidated = 1,
}

impl RecordState {
    /// Convert to the wire value.
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Parse a wire value.
    pub fn from_u32(value: u32) -> Result<Self, CoreError> {
        match value {
            0 => Ok(Self::Created),
            1 => Ok(Self::Invalidated),
            other => Err(CoreError::UnknownState(other)),
        }
    }

    /// Precedence during resolution. Higher dominates.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Invalidated => 1,
        }
    }

    /// Whether this state can never be left.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Invalidated)
    }
}

impl TryFrom<u32> for RecordState {
    type Error = CoreError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_u32(value)
    }
}

impl From<RecordState> for u32 {
    fn from(state: RecordState) -> Self {
        state.to_u32()
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Invalidated => f.write_str("invalidated"),
        }
    }
}

/// An authorization record, keyed by [`KeyHash`].
///
/// The credential fields are written once by the node that creates the
/// record. The invalidation fields are written by the node that revokes it.
/// `state` is derived from the replication log and never set by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key_hash: KeyHash,
    /// Creation time (Unix seconds).
    pub created_at: i64,
    pub public: bool,
    /// Satellite the access grant belongs to.
    pub satellite_address: String,
    /// Head of the macaroon embedded in the access grant.
    pub macaroon_head: Bytes,
    pub encrypted_secret_key: Bytes,
    pub encrypted_access_grant: Bytes,
    /// Expiration time (Unix seconds).
    pub expires_at: Option<i64>,
    pub invalidation_reason: Option<String>,
    /// Invalidation time (Unix seconds).
    pub invalidated_at: Option<i64>,
    pub state: RecordState,
}

impl Record {
    /// Create a new record in the `Created` state.
    pub fn new(
        key_hash: KeyHash,
        encrypted_secret_key: impl Into<Bytes>,
        encrypted_access_grant: impl Into<Bytes>,
        created_at: i64,
    ) -> Self {
        Self {
            key_hash,
            created_at,
            public: false,
            satellite_address: String::new(),
            macaroon_head: Bytes::new(),
            encrypted_secret_key: encrypted_secret_key.into(),
            encrypted_access_grant: encrypted_access_grant.into(),
            expires_at: None,
            invalidation_reason: None,
            invalidated_at: None,
            state: RecordState::Created,
        }
    }

    /// Mark the record as publicly shareable.
    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// Set the expiration time.
    pub fn with_expiration(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the denormalized origin metadata of the access grant.
    pub fn with_origin(
        mut self,
        satellite_address: impl Into<String>,
        macaroon_head: impl Into<Bytes>,
    ) -> Self {
        self.satellite_address = satellite_address.into();
        self.macaroon_head = macaroon_head.into();
        self
    }

    /// Whether the record has expired at `now` (Unix seconds).
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |expires_at| now >= expires_at)
    }

    /// Whether the record may be used to authorize a request at `now`.
    pub fn is_usable(&self, now: i64) -> bool {
        self.state == RecordState::Created && !self.is_expired(now)
    }

    /// Whether two records carry the same credential fields.
    pub fn same_credentials(&self, other: &Record) -> bool {
        self.key_hash == other.key_hash
            && self.created_at == other.created_at
            && self.public == other.public
            && self.satellite_address == other.satellite_address
            && self.macaroon_head == other.macaroon_head
            && self.encrypted_secret_key == other.encrypted_secret_key
            && self.encrypted_access_grant == other.encrypted_access_grant
            && self.expires_at == other.expires_at
    }
}

/// The log position that authored a piece of record content.
///
/// Versions are totally ordered so that the greater version wins: a higher
/// clock wins, and on equal clocks the smaller NodeId wins. NodeIds compare
/// in their encoded order, the id followed by `/`, as log keys sort, not by
/// raw bytes: `node-a` is smaller than `node` because `-` sorts before `/`.
/// Every node orders versions the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub node_id: NodeId,
    pub clock: Clock,
}

impl Version {
    pub fn new(node_id: NodeId, clock: Clock) -> Self {
        Self { node_id, clock }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| other.node_id.cmp(&self.node_id))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.clock)
    }
}

/// A record together with the versions that authored its content.
///
/// This is both the persisted shape of a record and the payload shipped to
/// peers during replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub record: Record,
    /// The `Created` entry that authored the credential fields.
    pub content_version: Version,
    /// The `Invalidated` entry that authored the invalidation fields.
    pub invalidation_version: Option<Version>,
}

impl VersionedRecord {
    /// A freshly created record authored at `content_version`.
    pub fn new(record: Record, content_version: Version) -> Self {
        Self {
            record,
            content_version,
            invalidation_version: None,
        }
    }

    pub fn key_hash(&self) -> &KeyHash {
        &self.record.key_hash
    }
}
