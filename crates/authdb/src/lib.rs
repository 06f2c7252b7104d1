//! # authdb
//!
//! A replicated store of authorization records. Every node accepts writes
//! locally and converges with its peers by pulling their replication logs.
//!
//! ## Overview
//!
//! - **Records**: credential material keyed by the hash of the access key,
//!   with a validity state
//! - **Replication log**: an append-only index of `(node, clock, key, state)`
//!   facts, the source of truth records are derived from
//! - **Replication**: one background task per peer pulls new facts since a
//!   durable watermark and merges them deterministically
//!
//! ## Key Concepts
//!
//! - **Invalidation is terminal**: once any node invalidates a key, every
//!   node ends up invalidated, whatever the clocks say
//! - **Deterministic tie-break**: concurrent creates converge on the content
//!   with the higher clock, then the smaller node id
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use authdb::{Node, NodeConfig};
//! use authdb::core::{KeyHash, Record};
//! use authdb::store::{SqliteStore, StoreConfig};
//! use authdb::sync::MemoryNetwork;
//!
//! async fn example() {
//!     let store = SqliteStore::open_persisted("authdb.sqlite", &StoreConfig::default()).unwrap();
//!     let node = Node::new(store, NodeConfig::default());
//!
//!     let key_hash = KeyHash::from_access_key_id(b"access-key-id");
//!     let record = Record::new(key_hash, b"secret".to_vec(), b"grant".to_vec(), 1_700_000_000);
//!     node.put(&record).await.unwrap();
//!
//!     let network = MemoryNetwork::new();
//!     network.register(node.node_id().clone(), Arc::new(node.exporter())).await;
//!     let transport = Arc::new(network.transport(node.node_id().clone()));
//!     let handle = node.start_replication(transport, vec!["peer-b".parse().unwrap()]);
//!
//!     node.invalidate(&key_hash, "rotated").await.unwrap();
//!     handle.shutdown().await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `authdb::core` - Identity, records, the log codec and the resolver
//! - `authdb::store` - Storage abstraction and SQLite
//! - `authdb::sync` - Peer protocol and replicator

pub mod error;
pub mod node;

pub use authdb_core as core;
pub use authdb_store as store;
pub use authdb_sync as sync;

pub use error::{NodeError, Result};
pub use node::{Node, NodeConfig, ReplicationHandle};

pub use authdb_core::{Clock, KeyHash, NodeId, Record, RecordState, ReplicationLogEntry};
