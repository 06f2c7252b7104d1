//! Node identity and the per-node clock.

use std::cmp::Ordering;
use std::fmt;
use std::iter;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::SEPARATOR;
use crate::error::CoreError;

/// Maximum length of a [`NodeId`] in bytes.
pub const MAX_NODE_ID_LEN: usize = 32;

/// Unique, stable identifier of a cluster member.
///
/// A NodeId is 1 to 32 bytes and never contains the log separator byte
/// (`/`). The log codec parses the NodeId as "whatever remains" once the
/// fixed-width fields are stripped, so the separator rule is a structural
/// precondition checked here, at construction, and not on every decode.
///
/// NodeIds are ordered the way their log encoding sorts: byte-lexicographic
/// over the id followed by the separator. This is plain byte order except
/// that `node` sorts after `node-a`, because `-` is below `/`. The same
/// order breaks clock ties during conflict resolution.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Bytes", into = "Bytes")]
pub struct NodeId(Bytes);

impl NodeId {
    /// Create a NodeId, validating length and the separator rule.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, CoreError> {
        let bytes = bytes.into();
        check_len(bytes.len())?;
        if bytes.contains(&SEPARATOR) {
            return Err(CoreError::InvalidNodeId(
                "node id must not contain '/'".into(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Generate a random NodeId of 32 lowercase hex characters.
    pub fn random() -> Self {
        let raw: [u8; 16] = rand::random();
        Self(Bytes::from(hex::encode(raw)))
    }

    /// Rebuild a NodeId from a decoded log key.
    ///
    /// Only the length is checked; the separator rule holds by construction
    /// for every id that was ever encoded.
    pub(crate) fn from_log_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        check_len(bytes.len())?;
        Ok(Self(Bytes::copy_from_slice(bytes)))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; a NodeId has at least one byte.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn check_len(len: usize) -> Result<(), CoreError> {
    if len == 0 {
        return Err(CoreError::InvalidNodeId("node id is empty".into()));
    }
    if len > MAX_NODE_ID_LEN {
        return Err(CoreError::InvalidNodeId(format!(
            "node id is {} bytes, max is {}",
            len, MAX_NODE_ID_LEN
        )));
    }
    Ok(())
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.0.iter().chain(iter::once(&SEPARATOR));
        let rhs = other.0.iter().chain(iter::once(&SEPARATOR));
        lhs.cmp(rhs)
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => f.write_str(s),
            _ => f.write_str(&hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl TryFrom<Bytes> for NodeId {
    type Error = CoreError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Self::new(bytes)
    }
}

impl From<NodeId> for Bytes {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Per-node sequence number.
///
/// Strictly increasing for entries authored by the owning node and never
/// reused. Clocks of different nodes are unrelated; comparing them only
/// matters as a deterministic tie-break input during resolution.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Clock(pub u64);

impl Clock {
    /// Encoded width in bytes.
    pub const LEN: usize = 8;

    /// The clock of a node that has authored nothing yet.
    pub const ZERO: Self = Self(0);

    /// Create a clock from a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The next clock value. Overflow is an error, never a wrap.
    pub fn next(&self) -> Result<Self, CoreError> {
        self.0.checked_add(1).map(Self).ok_or(CoreError::ClockOverflow)
    }

    /// Big-endian encoding, so byte order matches numeric order.
    pub const fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decode from exactly 8 big-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidClock(bytes.len()))?;
        Ok(Self(u64::from_be_bytes(arr)))
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Clock({})", self.0)
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Clock {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
