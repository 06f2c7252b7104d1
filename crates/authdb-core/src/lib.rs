//! # authdb Core
//!
//! Pure primitives for the replicated authorization record store.
//!
//! This crate contains no I/O, no storage, no networking. It defines the
//! values every node agrees on and the deterministic functions that let
//! independently written nodes converge.
//!
//! ## Key Types
//!
//! - [`NodeId`] - Stable identity of a cluster member
//! - [`Clock`] - Per-node sequence number versioning that node's writes
//! - [`KeyHash`] - 32-byte digest of an access credential, the primary key
//! - [`Record`] - The authorization payload plus its derived [`RecordState`]
//! - [`ReplicationLogEntry`] - An immutable `(node, clock, key, state)` fact
//!
//! ## Replication Log Codec
//!
//! Log entries are stored as ordered index keys. See the [`codec`] module for
//! the byte layout and its ordering guarantees.
//!
//! ## Conflict Resolution
//!
//! [`resolver::resolve`] and [`resolver::merge`] derive a record's state and
//! content from the set of log entries known for its key. Both are
//! commutative, associative and idempotent.

pub mod codec;
pub mod error;
pub mod identity;
pub mod record;
pub mod resolver;
pub mod types;

pub use codec::{log_range, node_range, ReplicationLogEntry, LOG_PREFIX, MIN_ENTRY_LEN, SEPARATOR};
pub use error::{CodecError, CoreError};
pub use identity::{Clock, NodeId, MAX_NODE_ID_LEN};
pub use record::{Record, RecordState, Version, VersionedRecord};
pub use resolver::{merge, resolve, Resolution};
pub use types::KeyHash;
