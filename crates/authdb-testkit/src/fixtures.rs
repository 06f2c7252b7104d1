//! Test fixtures and helpers.
//!
//! Common setup code for multi-node integration tests.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use authdb::{Node, NodeConfig, ReplicationHandle};
use authdb_core::{KeyHash, NodeId, Record};
use authdb_store::SqliteStore;
use authdb_sync::{CycleReport, MemoryNetwork, Replicator, ReplicatorConfig};

/// Nodes on temporary stores, wired together by a [`MemoryNetwork`].
///
/// Every node's exporter is registered, so any node can pull from any
/// other. Replication can be stepped by hand with [`TestCluster::pull`] or
/// run in the background with [`TestCluster::start_replication`].
pub struct TestCluster {
    network: Arc<MemoryNetwork>,
    nodes: Vec<Node<SqliteStore>>,
    config: NodeConfig,
}

impl TestCluster {
    /// Create a cluster with the default configuration.
    pub async fn new(ids: &[&str]) -> Self {
        Self::with_config(ids, NodeConfig::default()).await
    }

    /// Create a cluster whose nodes all use `config`.
    pub async fn with_config(ids: &[&str], config: NodeConfig) -> Self {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let node_id: NodeId = id.parse().expect("fixture node id is valid");
            let store = SqliteStore::open_temporary(node_id.clone()).expect("temporary store opens");
            let node = Node::new(store, config.clone());
            network.register(node_id, Arc::new(node.exporter())).await;
            nodes.push(node);
        }
        Self {
            network,
            nodes,
            config,
        }
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    pub fn nodes(&self) -> &[Node<SqliteStore>] {
        &self.nodes
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id().clone()).collect()
    }

    /// The node named `id`. Panics if there is none.
    pub fn node(&self, id: &str) -> &Node<SqliteStore> {
        self.nodes
            .iter()
            .find(|n| n.node_id().as_bytes() == id.as_bytes())
            .unwrap_or_else(|| panic!("no node {} in cluster", id))
    }

    /// Run one replication cycle in which `into` pulls from `from`.
    pub async fn pull(&self, from: &str, into: &str) -> authdb_sync::Result<CycleReport> {
        let local = self.node(into);
        let replicator = Replicator::new(
            Arc::clone(local.store()),
            Arc::new(self.network.transport(local.node_id().clone())),
            self.node(from).node_id().clone(),
            self.config.replicator.clone(),
        );
        replicator.run_cycle(&CancellationToken::new()).await
    }

    /// Pull between every ordered pair of nodes until a full round applies
    /// nothing. Returns the number of rounds that applied entries.
    pub async fn sync_all(&self) -> authdb_sync::Result<usize> {
        let ids: Vec<String> = self.node_ids().iter().map(|id| id.to_string()).collect();
        let mut rounds = 0;
        loop {
            let mut applied = 0;
            for into in &ids {
                for from in ids.iter().filter(|id| *id != into) {
                    applied += self.pull(from, into).await?.applied;
                }
            }
            if applied == 0 {
                return Ok(rounds);
            }
            rounds += 1;
        }
    }

    /// Start background replication on every node, full mesh.
    pub fn start_replication(&self) -> Vec<ReplicationHandle> {
        let peers = self.node_ids();
        self.nodes
            .iter()
            .map(|node| {
                let transport = Arc::new(self.network.transport(node.node_id().clone()));
                node.start_replication(transport, peers.clone())
            })
            .collect()
    }

    /// Whether every node answers `get(key_hash)` identically.
    pub async fn converged(&self, key_hash: &KeyHash) -> bool {
        let mut answers = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            answers.push(node.get(key_hash).await.ok());
        }
        answers.windows(2).all(|pair| pair[0] == pair[1])
    }

    pub async fn partition(&self, id: &str) {
        self.network.partition(self.node(id).node_id()).await;
    }

    pub async fn heal(&self, id: &str) {
        self.network.heal(self.node(id).node_id()).await;
    }
}

/// A record for key hash `[n; 32]` whose secret names its author.
pub fn test_record(n: u8, secret: &str) -> Record {
    Record::new(
        KeyHash::from_bytes([n; 32]),
        secret.as_bytes().to_vec(),
        format!("grant-{}", n).into_bytes(),
        1_700_000_000,
    )
}

/// A cluster of `count` nodes named `n1`, `n2`, ...
pub async fn numbered_cluster(count: usize) -> TestCluster {
    let ids: Vec<String> = (1..=count).map(|i| format!("n{}", i)).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    TestCluster::new(&ids).await
}
