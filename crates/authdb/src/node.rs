//! The Node: the record resolution API plus replication supervision.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use authdb_core::{KeyHash, NodeId, Record, ReplicationLogEntry};
use authdb_store::{now_secs, retry_on_conflict, InvalidateOutcome, RetryPolicy, Store};
use authdb_sync::{LogExporter, Replicator, ReplicatorConfig, ReplicatorStatus, Transport};

use crate::error::{NodeError, Result};

/// Configuration for a Node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Backoff for local writes that hit a write conflict.
    pub retry: RetryPolicy,
    /// Replication configuration, shared by every peer.
    pub replicator: ReplicatorConfig,
}

/// One member of the cluster.
///
/// Provides:
/// - `get`, `put` and `invalidate` for the authentication front end
/// - a [`LogExporter`] answering peers
/// - one replication task per peer
pub struct Node<S: Store> {
    store: Arc<S>,
    config: NodeConfig,
}

impl<S: Store + 'static> Node<S> {
    /// Create a node on top of an opened store.
    pub fn new(store: S, config: NodeConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }

    /// Create a node sharing an existing store handle.
    pub fn from_arc(store: Arc<S>, config: NodeConfig) -> Self {
        Self { store, config }
    }

    pub fn node_id(&self) -> &NodeId {
        self.store.node_id()
    }

    /// Get the store reference.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Record Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Look up the record for `key_hash`.
    pub async fn get(&self, key_hash: &KeyHash) -> Result<Record> {
        Ok(self.store.get(key_hash).await?)
    }

    /// Store a new record.
    ///
    /// Fails with `AlreadyExists` if the key hash has a record, and with
    /// `Conflict` only once the retry policy is exhausted.
    pub async fn put(&self, record: &Record) -> Result<ReplicationLogEntry> {
        let entry = retry_on_conflict(&self.config.retry, || self.store.put(record)).await?;
        debug!(key_hash = %entry.key_hash, clock = %entry.clock, "record created");
        Ok(entry)
    }

    /// Invalidate the record for `key_hash`. Invalidating an invalidated
    /// record succeeds and changes nothing.
    pub async fn invalidate(&self, key_hash: &KeyHash, reason: &str) -> Result<()> {
        let invalidated_at = now_secs();
        let outcome = retry_on_conflict(&self.config.retry, || {
            self.store.invalidate(key_hash, reason, invalidated_at)
        })
        .await?;

        match outcome {
            InvalidateOutcome::Invalidated(entry) => {
                debug!(%key_hash, clock = %entry.clock, "record invalidated");
            }
            InvalidateOutcome::AlreadyInvalidated => {
                debug!(%key_hash, "record already invalidated");
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replication
    // ─────────────────────────────────────────────────────────────────────────

    /// The handler serving this node's log to peers.
    pub fn exporter(&self) -> LogExporter<S> {
        LogExporter::new(Arc::clone(&self.store))
    }

    /// Spawn one replicator per peer.
    ///
    /// The node's own id is skipped if it appears in `peers`. Tasks run
    /// until [`ReplicationHandle::shutdown`] or until the handle is dropped.
    pub fn start_replication<T: Transport + 'static>(
        &self,
        transport: Arc<T>,
        peers: impl IntoIterator<Item = NodeId>,
    ) -> ReplicationHandle {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut statuses = Vec::new();

        for peer in peers {
            if &peer == self.node_id() {
                continue;
            }
            let replicator = Replicator::new(
                Arc::clone(&self.store),
                Arc::clone(&transport),
                peer.clone(),
                self.config.replicator.clone(),
            );
            statuses.push((peer, replicator.subscribe()));

            let cancel = cancel.clone();
            let task = tokio::spawn(async move { replicator.run(cancel).await });
            tasks.push(AbortOnDropHandle::new(task));
        }

        info!(node = %self.node_id(), peers = tasks.len(), "replication started");
        ReplicationHandle {
            cancel,
            tasks,
            statuses,
        }
    }
}

/// Running replication tasks of one node.
///
/// Dropping the handle cancels and aborts the tasks without waiting for
/// them. A merge transaction already running finishes on its own.
pub struct ReplicationHandle {
    cancel: CancellationToken,
    tasks: Vec<AbortOnDropHandle<()>>,
    statuses: Vec<(NodeId, watch::Receiver<ReplicatorStatus>)>,
}

impl ReplicationHandle {
    /// Status receivers, one per peer.
    pub fn statuses(&self) -> &[(NodeId, watch::Receiver<ReplicatorStatus>)] {
        &self.statuses
    }

    /// Current status of the replicator for `peer`.
    pub fn status(&self, peer: &NodeId) -> Option<ReplicatorStatus> {
        self.statuses
            .iter()
            .find(|(id, _)| id == peer)
            .map(|(_, rx)| rx.borrow().clone())
    }

    /// Cancel every replicator and wait for it to stop.
    ///
    /// A merge in progress commits before its task exits.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        let mut result = Ok(());
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                warn!(error = %err, "replication task failed");
                result = Err(NodeError::TaskJoin(err.to_string()));
            }
        }
        info!("replication stopped");
        result
    }
}

impl Drop for ReplicationHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authdb_core::RecordState;
    use authdb_store::SqliteStore;

    fn node(id: &str) -> Node<SqliteStore> {
        let store = SqliteStore::open_temporary(id.parse().unwrap()).unwrap();
        Node::new(store, NodeConfig::default())
    }

    fn record(n: u8) -> Record {
        Record::new(KeyHash::from_bytes([n; 32]), b"sk".to_vec(), b"grant".to_vec(), 100)
    }

    #[tokio::test]
    async fn test_put_get_invalidate() {
        let node = node("n1");
        let key_hash = KeyHash::from_bytes([1; 32]);

        let entry = node.put(&record(1)).await.unwrap();
        assert_eq!(entry.state, RecordState::Created);
        assert_eq!(node.get(&key_hash).await.unwrap().state, RecordState::Created);

        node.invalidate(&key_hash, "leaked").await.unwrap();
        let invalidated = node.get(&key_hash).await.unwrap();
        assert_eq!(invalidated.state, RecordState::Invalidated);
        assert_eq!(invalidated.invalidation_reason.as_deref(), Some("leaked"));
        assert!(invalidated.invalidated_at.is_some());
    }

    #[tokio::test]
    async fn test_api_error_set() {
        let node = node("n1");
        let missing = KeyHash::from_bytes([9; 32]);

        assert!(matches!(node.get(&missing).await, Err(NodeError::NotFound(_))));
        assert!(matches!(
            node.invalidate(&missing, "x").await,
            Err(NodeError::NotFound(_))
        ));

        node.put(&record(1)).await.unwrap();
        assert!(matches!(
            node.put(&record(1)).await,
            Err(NodeError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let node = node("n1");
        let key_hash = KeyHash::from_bytes([1; 32]);
        node.put(&record(1)).await.unwrap();

        node.invalidate(&key_hash, "first").await.unwrap();
        node.invalidate(&key_hash, "second").await.unwrap();

        let log = node.store().find_log_by_key_hash(&key_hash).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(
            node.get(&key_hash).await.unwrap().invalidation_reason.as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn test_start_replication_skips_self() {
        let node = node("n1");
        let network = authdb_sync::MemoryNetwork::new();
        let transport = Arc::new(network.transport(node.node_id().clone()));

        let handle = node.start_replication(
            transport,
            ["n1".parse().unwrap(), "n2".parse().unwrap()],
        );
        assert_eq!(handle.statuses().len(), 1);
        assert!(handle.status(&"n2".parse().unwrap()).is_some());
        assert!(handle.status(&"n1".parse().unwrap()).is_none());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_replicators() {
        let node = node("n1");
        let network = authdb_sync::MemoryNetwork::new();
        let transport = Arc::new(network.transport(node.node_id().clone()));

        let handle = node.start_replication(transport, ["n2".parse().unwrap()]);
        let mut status = handle.statuses()[0].1.clone();
        drop(handle);

        // Each task owns its replicator, so the status sender goes with it.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while status.changed().await.is_ok() {}
        })
        .await
        .unwrap();
    }
}
