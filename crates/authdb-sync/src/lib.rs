//! # authdb Sync
//!
//! Pull-based replication of the record store between nodes.
//!
//! ## Overview
//!
//! Every node serves its log through a [`LogExporter`] and runs one
//! [`Replicator`] per peer. A replicator asks the peer for the entries the
//! peer authored after the local watermark, fetches the records those
//! entries touch, and merges both into the local store in one transaction.
//!
//! ## Key Properties
//!
//! - **Idempotent**: replaying a batch changes nothing
//! - **Order-independent**: merge results do not depend on arrival order
//! - **Resumable**: the watermark only moves with committed merges
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use authdb_core::NodeId;
//! use authdb_store::SqliteStore;
//! use authdb_sync::{LogExporter, MemoryNetwork, Replicator, ReplicatorConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() {
//!     let local: NodeId = "n1".parse().unwrap();
//!     let peer: NodeId = "n2".parse().unwrap();
//!     let store = Arc::new(SqliteStore::open_temporary(local.clone()).unwrap());
//!
//!     let network = MemoryNetwork::new();
//!     network.register(local.clone(), Arc::new(LogExporter::new(Arc::clone(&store)))).await;
//!
//!     let transport = Arc::new(network.transport(local));
//!     let replicator = Replicator::new(store, transport, peer, ReplicatorConfig::default());
//!     replicator.run(CancellationToken::new()).await;
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Replicator (n1)                      Peer (n2)
//!   |-------- ExportLog(n2, since) ---->|
//!   |<------- Log ----------------------|
//!   |-------- FetchRecords ------------>|
//!   |<------- Records ------------------|
//!   |  merge + advance watermark        |
//! ```

pub mod error;
pub mod exporter;
pub mod messages;
pub mod replicator;
pub mod transport;

pub use error::{Result, SyncError};
pub use exporter::LogExporter;
pub use messages::{limits, PeerErrorCode, PeerRequest, PeerResponse, PROTOCOL_VERSION};
pub use replicator::{
    CycleReport, Replicator, ReplicatorConfig, ReplicatorState, ReplicatorStatus,
};
pub use transport::{memory::MemoryNetwork, memory::MemoryTransport, RequestHandler, Transport};
