//! Leader failover: epochs fence stale writers and committed data survives.

mod common;

use std::sync::Arc;

use common::{wait_until, TestCluster, CONVERGE_TIMEOUT};
use tessera_cluster::directory::MapKey;
use tessera_cluster::error::ClusterError;
use tessera_cluster::namespace::Namespace;
use tessera_cluster::partition::{DataCommand, WriteOp};
use tessera_cluster::router::ReadSession;
use tessera_cluster::transport::{DataClient, ReadKind, ReadPolicy, ReadRequest};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failover_bumps_epoch_and_fences_stale_writes() {
    let cluster = TestCluster::start(3).await;
    cluster.create_object(Namespace::Table, "accounts", 1).await;
    let key = MapKey::new(Namespace::Table, "accounts");

    let entry = cluster.shard_map(Namespace::Table, "accounts").await.entries[0].clone();
    let old_epoch = entry.epoch;
    let old_leader = entry.leader.expect("leader reported");
    let group_id = entry.group_id;

    // Write through a router on a different node; succeeds at the current
    // epoch.
    let writer = cluster
        .nodes
        .iter()
        .find(|n| n.node_id() != old_leader)
        .unwrap();
    writer
        .router()
        .write(
            "tester",
            &key,
            b"k",
            vec![WriteOp::Put {
                key: b"k".to_vec(),
                value: b"a".to_vec(),
            }],
        )
        .await
        .expect("initial write");

    cluster.kill(old_leader);

    // A survivor wins the election, reports leadership, and the directory
    // bumps the partition epoch.
    let new_entry = wait_until(CONVERGE_TIMEOUT, || async {
        let leader = cluster.directory_leader().await;
        let map = leader.directory().store().shard_map(&key)?;
        let entry = map.entries[0].clone();
        let reported = entry.leader?;
        (reported != old_leader && entry.epoch > old_epoch).then_some(entry)
    })
    .await
    .expect("failover never reported");
    let new_leader = new_entry.leader.unwrap();
    let new_epoch = new_entry.epoch;
    assert!(new_epoch > old_epoch, "epoch must strictly increase");

    // Wait until the new leader has installed the bumped epoch.
    let client: Arc<dyn DataClient> = Arc::clone(&cluster.mesh) as _;
    let probe = ReadRequest {
        policy: ReadPolicy::Eventual,
        kind: ReadKind::Get { key: b"k".to_vec() },
        min_applied: 0,
    };
    wait_until(CONVERGE_TIMEOUT, || {
        let client = Arc::clone(&client);
        let probe = probe.clone();
        async move {
            let resp = client.read(new_leader, group_id, probe).await.ok()?;
            (resp.epoch >= new_epoch).then_some(())
        }
    })
    .await
    .expect("new leader never installed the bumped epoch");

    // A retry still presenting the pre-failover epoch is fenced.
    let stale = client
        .write(
            new_leader,
            group_id,
            old_epoch,
            DataCommand::Write {
                ops: vec![WriteOp::Put {
                    key: b"k".to_vec(),
                    value: b"stale".to_vec(),
                }],
                token: None,
            },
        )
        .await;
    match stale {
        Err(ClusterError::EpochConflict { presented, current }) => {
            assert_eq!(presented, old_epoch);
            assert!(current > old_epoch);
        }
        other => panic!("expected EpochConflict, got {other:?}"),
    }

    // A strong read after failover observes the majority-acknowledged write.
    let reader = cluster
        .nodes
        .iter()
        .find(|n| n.node_id() != old_leader)
        .unwrap();
    let row = wait_until(CONVERGE_TIMEOUT, || async {
        reader
            .router()
            .get(
                "tester",
                &key,
                b"k",
                ReadPolicy::Strong,
                &mut ReadSession::default(),
            )
            .await
            .ok()
            .flatten()
    })
    .await
    .expect("strong read after failover");
    assert_eq!(row.value, b"a");

    // The fenced write must not have mutated anything.
    let row = reader
        .router()
        .get(
            "tester",
            &key,
            b"k",
            ReadPolicy::Strong,
            &mut ReadSession::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.value, b"a");

    for node in &cluster.nodes {
        node.stop();
    }
}
