//! Replication log codec.
//!
//! A log entry is stored as a key with no value. The key layout is:
//!
//! ```text
//! replication_log/ <node id> / <clock: 8B BE> / <key hash: 32B> / <state: 4B BE>
//! ```
//!
//! Under plain byte order, keys sort by NodeId, then Clock, then KeyHash,
//! then State. All entries authored by one node after a given clock form a
//! single contiguous key range, which is what incremental replication scans.
//!
//! Decoding parses from the right: every field except the NodeId has a fixed
//! width, so the NodeId is whatever remains between the prefix and the first
//! separator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::identity::{Clock, NodeId};
use crate::record::{RecordState, Version};
use crate::types::KeyHash;

/// Field separator. Never valid inside a NodeId.
pub const SEPARATOR: u8 = b'/';

/// Namespace prefix of every log key, separator included.
pub const LOG_PREFIX: &[u8] = b"replication_log/";

const SEPARATOR_LEN: usize = 1;
const STATE_LEN: usize = 4;

/// Shortest byte string the decoder will look at.
///
/// Prefix, three separators and the fixed-width fields. A valid entry is at
/// least one byte longer, since the NodeId is never empty.
pub const MIN_ENTRY_LEN: usize =
    LOG_PREFIX.len() + 3 * SEPARATOR_LEN + KeyHash::LEN + Clock::LEN + STATE_LEN;

/// An immutable replication fact: node `node_id` produced `state` for
/// `key_hash` at its local sequence number `clock`.
///
/// On the wire an entry travels as its encoded key, so peers decode (and
/// reject) exactly what a local scan would.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Bytes", into = "Bytes")]
pub struct ReplicationLogEntry {
    pub node_id: NodeId,
    pub clock: Clock,
    pub key_hash: KeyHash,
    pub state: RecordState,
}

impl ReplicationLogEntry {
    pub fn new(node_id: NodeId, clock: Clock, key_hash: KeyHash, state: RecordState) -> Self {
        Self {
            node_id,
            clock,
            key_hash,
            state,
        }
    }

    /// The version this entry authors.
    pub fn version(&self) -> Version {
        Version::new(self.node_id.clone(), self.clock)
    }

    /// Encode as an ordered index key.
    pub fn encode(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(MIN_ENTRY_LEN + self.node_id.len());
        key.extend_from_slice(LOG_PREFIX);
        key.extend_from_slice(self.node_id.as_bytes());
        key.push(SEPARATOR);
        key.extend_from_slice(&self.clock.to_bytes());
        key.push(SEPARATOR);
        key.extend_from_slice(self.key_hash.as_bytes());
        key.push(SEPARATOR);
        key.extend_from_slice(&self.state.to_u32().to_be_bytes());
        key
    }

    /// Decode an index key.
    ///
    /// The result owns its bytes; nothing borrows from `bytes`, so callers
    /// may pass buffers that the storage engine reuses between rows.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < MIN_ENTRY_LEN {
            return Err(CodecError::EntryTooShort {
                len: bytes.len(),
                min: MIN_ENTRY_LEN,
            });
        }
        if !bytes.starts_with(LOG_PREFIX) {
            return Err(CodecError::MissingPrefix);
        }

        let state_start = bytes.len() - STATE_LEN;
        let state_sep = state_start - SEPARATOR_LEN;
        let key_hash_start = state_sep - KeyHash::LEN;
        let key_hash_sep = key_hash_start - SEPARATOR_LEN;
        let clock_start = key_hash_sep - Clock::LEN;
        let clock_sep = clock_start - SEPARATOR_LEN;

        for pos in [clock_sep, key_hash_sep, state_sep] {
            if bytes[pos] != SEPARATOR {
                return Err(CodecError::MissingSeparator(pos));
            }
        }

        let mut state_bytes = [0u8; STATE_LEN];
        state_bytes.copy_from_slice(&bytes[state_start..]);
        let state = RecordState::from_u32(u32::from_be_bytes(state_bytes))?;

        let mut key_hash = [0u8; KeyHash::LEN];
        key_hash.copy_from_slice(&bytes[key_hash_start..state_sep]);

        let clock = Clock::from_bytes(&bytes[clock_start..key_hash_sep])?;
        let node_id = NodeId::from_log_bytes(&bytes[LOG_PREFIX.len()..clock_sep])?;

        Ok(Self {
            node_id,
            clock,
            key_hash: KeyHash::from_bytes(key_hash),
            state,
        })
    }
}

impl TryFrom<Bytes> for ReplicationLogEntry {
    type Error = CodecError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Self::decode(&bytes)
    }
}

impl From<ReplicationLogEntry> for Bytes {
    fn from(entry: ReplicationLogEntry) -> Self {
        Bytes::from(entry.encode())
    }
}

/// Key range holding every entry authored by `node_id` with a clock strictly
/// greater than `since`.
///
/// Returns `(start, end)` with `start` inclusive and `end` exclusive, or
/// `None` when no clock can follow `since`. The end bound replaces the
/// separator after the NodeId with the next byte value (`0`); no byte lies
/// between the two, so the range holds exactly this node's keys.
pub fn node_range(node_id: &NodeId, since: Clock) -> Option<(Vec<u8>, Vec<u8>)> {
    let first = since.next().ok()?;

    let mut node_prefix = Vec::with_capacity(LOG_PREFIX.len() + node_id.len() + 1);
    node_prefix.extend_from_slice(LOG_PREFIX);
    node_prefix.extend_from_slice(node_id.as_bytes());

    let mut start = node_prefix.clone();
    start.push(SEPARATOR);
    start.extend_from_slice(&first.to_bytes());

    let mut end = node_prefix;
    end.push(SEPARATOR + 1);

    Some((start, end))
}

/// Key range holding the whole log: `(start inclusive, end exclusive)`.
pub fn log_range() -> (Vec<u8>, Vec<u8>) {
    let start = LOG_PREFIX.to_vec();
    let mut end = LOG_PREFIX.to_vec();
    if let Some(last) = end.last_mut() {
        *last = SEPARATOR + 1;
    }
    (start, end)
}
