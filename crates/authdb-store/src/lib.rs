//! # authdb Store
//!
//! The local record store: records and the replication log in one embedded
//! transactional engine.
//!
//! ## Overview
//!
//! The [`Store`] trait is the storage interface the node and the replicator
//! program against. [`SqliteStore`] implements it on SQLite, with records
//! and the key-only replication log as two tables of one database.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`InvalidateOutcome`] - Result of invalidating a record
//! - [`BatchOutcome`] - Result of merging a replicated batch
//! - [`RetryPolicy`] - Backoff for transactions that lost a write race
//!
//! ## Usage
//!
//! ```rust,no_run
//! use authdb_core::{KeyHash, NodeId, Record};
//! use authdb_store::{retry_on_conflict, RetryPolicy, SqliteStore, Store, StoreConfig};
//!
//! async fn example() {
//!     let node_id: NodeId = "node-a".parse().unwrap();
//!     let store = SqliteStore::open("authdb.sqlite", node_id, &StoreConfig::default()).unwrap();
//!
//!     let key_hash = KeyHash::from_access_key_id(b"access-key-id");
//!     let record = Record::new(key_hash, b"secret".to_vec(), b"grant".to_vec(), 1_700_000_000);
//!
//!     let policy = RetryPolicy::default();
//!     let entry = retry_on_conflict(&policy, || store.put(&record)).await.unwrap();
//!     println!("created at {}", entry.clock);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **One transaction per mutation**: the record write, the log append and
//!   the clock bump commit together or not at all
//! - **Key-only log**: every fact lives in the log key; there are no values
//! - **No in-process locks across tasks**: coordination is the engine's
//!   write lock, surfaced as [`StoreError::Conflict`]

pub mod error;
pub mod migration;
pub mod retry;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use sqlite::{SqliteStore, StoreConfig};
pub use traits::{BatchOutcome, InvalidateOutcome, Store};

/// Current time in Unix seconds.
pub fn now_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
