//! Staged replica moves: draining a node walks add-learner → catch-up →
//! promote → lease transfer → remove, and data stays available throughout.

mod common;

use std::time::Duration;

use common::{wait_until, TestCluster};
use tessera_cluster::directory::MapKey;
use tessera_cluster::namespace::Namespace;
use tessera_cluster::partition::WriteOp;
use tessera_cluster::router::ReadSession;
use tessera_cluster::transport::ReadPolicy;

/// Drains take several staged steps across rebalance ticks.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(40);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn draining_a_node_moves_replicas_off_it() {
    let cluster = TestCluster::start(4).await;
    cluster.create_object(Namespace::Table, "inventory", 2).await;
    let key = MapKey::new(Namespace::Table, "inventory");

    // Seed data so the move has real state to carry.
    let writer = &cluster.nodes[0];
    for i in 0..25u32 {
        let row_key = format!("sku{i:03}");
        writer
            .router()
            .write(
                "tester",
                &key,
                row_key.as_bytes(),
                vec![WriteOp::Put {
                    key: row_key.clone().into_bytes(),
                    value: format!("qty-{i}").into_bytes(),
                }],
            )
            .await
            .expect("seed write");
    }

    // Pick a replica-hosting node to drain.
    let map = cluster.shard_map(Namespace::Table, "inventory").await;
    let victim = map.entries[0].replicas[0];
    let epochs_before: Vec<u64> = map.entries.iter().map(|e| e.epoch).collect();

    let leader = cluster.directory_leader().await;
    leader.admin().drain_node(victim).await.expect("drain");

    // The rebalancer stages the replacement and eventually removes the
    // drained node from every replica set.
    wait_until(DRAIN_TIMEOUT, || async {
        let leader = cluster.directory_leader().await;
        let map = leader.directory().store().shard_map(&key)?;
        let gone = map.entries.iter().all(|e| {
            !e.replicas.contains(&victim)
                && !e.non_voters.contains(&victim)
                && e.leader != Some(victim)
        });
        gone.then_some(())
    })
    .await
    .expect("drained node still holds replicas");

    // Membership changes bumped the affected entries' epochs.
    let map_after = cluster.shard_map(Namespace::Table, "inventory").await;
    for (entry, before) in map_after.entries.iter().zip(epochs_before) {
        if !entry.replicas.contains(&victim) {
            assert!(entry.epoch >= before, "epochs never regress");
        }
    }

    // Data stayed available through the move.
    let reader = cluster
        .nodes
        .iter()
        .find(|n| n.node_id() != victim)
        .unwrap();
    let row = wait_until(DRAIN_TIMEOUT, || async {
        reader
            .router()
            .get(
                "tester",
                &key,
                b"sku007",
                ReadPolicy::Strong,
                &mut ReadSession::default(),
            )
            .await
            .ok()
            .flatten()
    })
    .await
    .expect("row readable after drain");
    assert_eq!(row.value, b"qty-7");

    for node in &cluster.nodes {
        node.stop();
    }
}
