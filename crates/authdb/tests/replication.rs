//! Background replication and durability across restarts.

use std::sync::Arc;
use std::time::Duration;

use authdb::store::{SqliteStore, StoreConfig, Store};
use authdb::sync::{MemoryNetwork, ReplicatorConfig, ReplicatorState};
use authdb::{KeyHash, Node, NodeConfig, NodeId, RecordState};
use authdb_testkit::{numbered_cluster, test_record, TestCluster};
use proptest::prelude::*;

fn fast_config() -> NodeConfig {
    NodeConfig {
        replicator: ReplicatorConfig {
            interval: Duration::from_millis(10),
            ..ReplicatorConfig::default()
        },
        ..NodeConfig::default()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_replication_converges() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let cluster = TestCluster::with_config(&["n1", "n2", "n3"], fast_config()).await;
    cluster.node("n1").put(&test_record(1, "a")).await?;
    cluster.node("n2").put(&test_record(2, "b")).await?;
    cluster.node("n3").put(&test_record(1, "c")).await?;
    cluster
        .node("n2")
        .invalidate(&KeyHash::from_bytes([2; 32]), "expired")
        .await?;
    let handles = cluster.start_replication();

    let c = &cluster;
    eventually(move || async move {
        c.converged(&KeyHash::from_bytes([1; 32])).await
            && c.converged(&KeyHash::from_bytes([2; 32])).await
            && c.node("n3").get(&KeyHash::from_bytes([2; 32])).await.is_ok()
    })
    .await;

    let record = cluster.node("n2").get(&KeyHash::from_bytes([1; 32])).await?;
    assert_eq!(&record.encrypted_secret_key[..], b"a");

    let n1 = &handles[0];
    let n2_id: NodeId = "n2".parse()?;
    let status = n1.status(&n2_id).expect("n1 replicates n2");
    assert!(status.cycles > 0);
    assert!(status.watermark.is_some());

    for handle in handles {
        handle.shutdown().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_replicators() -> anyhow::Result<()> {
    let cluster = TestCluster::with_config(&["n1", "n2"], fast_config()).await;
    let handles = cluster.start_replication();

    let mut receivers: Vec<_> = handles
        .iter()
        .flat_map(|h| h.statuses().iter().map(|(_, rx)| rx.clone()))
        .collect();

    for handle in handles {
        handle.shutdown().await?;
    }
    for rx in &mut receivers {
        assert_eq!(rx.borrow_and_update().state, ReplicatorState::Stopped);
    }

    // Writes after shutdown stay local.
    cluster.node("n1").put(&test_record(7, "late")).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cluster.node("n2").get(&KeyHash::from_bytes([7; 32])).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_partition_heals() -> anyhow::Result<()> {
    let cluster = numbered_cluster(3).await;
    cluster.partition("n3").await;

    cluster.node("n1").put(&test_record(1, "a")).await?;
    cluster.node("n3").put(&test_record(3, "c")).await?;
    assert!(cluster.sync_all().await.is_err());

    cluster.heal("n3").await;
    cluster.sync_all().await?;
    assert!(cluster.converged(&KeyHash::from_bytes([1; 32])).await);
    assert!(cluster.converged(&KeyHash::from_bytes([3; 32])).await);
    Ok(())
}

#[tokio::test]
async fn test_file_backed_nodes_resume_after_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path_a = dir.path().join("a.sqlite");
    let path_b = dir.path().join("b.sqlite");
    let config = StoreConfig::default();

    let a_id: NodeId = "node-a".parse()?;
    let b_id: NodeId = "node-b".parse()?;
    let network = MemoryNetwork::new();

    let a = Node::new(SqliteStore::open(&path_a, a_id.clone(), &config)?, fast_config());
    network.register(a_id.clone(), Arc::new(a.exporter())).await;
    a.put(&test_record(1, "first")).await?;

    {
        let b = Node::new(SqliteStore::open(&path_b, b_id.clone(), &config)?, fast_config());
        let handle = b.start_replication(Arc::new(network.transport(b_id.clone())), [a_id.clone()]);
        let b = &b;
        eventually(move || async move { b.get(&KeyHash::from_bytes([1; 32])).await.is_ok() }).await;
        handle.shutdown().await?;
    }

    a.put(&test_record(2, "second")).await?;
    a.invalidate(&KeyHash::from_bytes([1; 32]), "rotated").await?;

    // Reopened under its stored identity, b resumes from its watermark.
    let b = Node::new(SqliteStore::open_persisted(&path_b, &config)?, fast_config());
    assert_eq!(b.node_id(), &b_id);
    assert_eq!(b.store().watermark(&a_id).await?, Some(authdb::Clock::new(1)));

    let handle = b.start_replication(Arc::new(network.transport(b_id.clone())), [a_id.clone()]);
    let b_ref = &b;
    eventually(move || async move {
        matches!(
            b_ref.get(&KeyHash::from_bytes([1; 32])).await,
            Ok(record) if record.state == RecordState::Invalidated
        )
    })
    .await;
    handle.shutdown().await?;

    assert_eq!(b.store().watermark(&a_id).await?, Some(authdb::Clock::new(3)));
    assert!(b.get(&KeyHash::from_bytes([2; 32])).await.is_ok());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever writes each node makes, a full sync leaves all nodes agreeing.
    #[test]
    fn test_random_workloads_converge(
        ops in prop::collection::vec((0usize..3, 0u8..6, any::<bool>()), 1..24),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let cluster = numbered_cluster(3).await;
            for (node, key, invalidate) in &ops {
                let node = &cluster.nodes()[*node];
                if *invalidate {
                    let _ = node.invalidate(&KeyHash::from_bytes([*key; 32]), "random").await;
                } else {
                    let _ = node.put(&test_record(*key, &node.node_id().to_string())).await;
                }
            }
            cluster.sync_all().await.unwrap();
            for key in 0u8..6 {
                assert!(cluster.converged(&KeyHash::from_bytes([key; 32])).await, "key {}", key);
            }
        });
    }
}
