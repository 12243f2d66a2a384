//! Schema-change coordination: quorum apply, stragglers converge exactly
//! once, preconditions reject without mutation.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{wait_until, TestCluster, CONVERGE_TIMEOUT};
use tessera_cluster::error::ClusterError;
use tessera_cluster::schema::{ApplyMode, SchemaOp, SchemaOpId};

const SCOPE: &str = "table/users";

fn op(counter: u64, scope_epoch: u64, mode: ApplyMode) -> SchemaOp {
    SchemaOp {
        id: SchemaOpId {
            node_id: 1,
            counter,
        },
        scope_epoch,
        payload: b"ADD COLUMN email".to_vec(),
        objects: vec!["users".to_string()],
        preconditions: BTreeMap::new(),
        apply_mode: mode,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_apply_succeeds_and_straggler_converges_once() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.directory_leader().await;
    let members: Vec<u64> = vec![1, 2, 3];

    // Partition off one non-leader member.
    let straggler = members
        .iter()
        .copied()
        .find(|id| *id != leader.node_id())
        .unwrap();
    cluster.mesh.set_down(straggler, true);

    let coordinator = leader.schema_coordinator();
    let outcome = coordinator
        .submit(
            SCOPE,
            op(1, 0, ApplyMode::Quorum(2)),
            &members,
            Duration::from_secs(10),
        )
        .await
        .expect("quorum apply");
    assert!(outcome.applied_members >= 2);
    assert_eq!(outcome.position, 1);

    // The partitioned member saw nothing.
    assert_eq!(cluster.node(straggler).schema_catalog().applied_count(), 0);

    // Reconnect: the member resumes from its durable cursor and applies the
    // missed operation exactly once.
    cluster.mesh.set_down(straggler, false);
    let catalog = cluster.node(straggler).schema_catalog().clone();
    wait_until(CONVERGE_TIMEOUT, || async {
        (catalog.applied_count() == 1).then_some(())
    })
    .await
    .expect("straggler converged");

    wait_until(CONVERGE_TIMEOUT, || async {
        let state = leader.directory().state();
        let log = state.schema_logs.get(SCOPE)?;
        (log.cursors.get(&straggler).copied() == Some(1)).then_some(())
    })
    .await
    .expect("straggler cursor reported");

    // No re-application of completed operations.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(catalog.applied_count(), 1);
    assert_eq!(catalog.version_of("users"), 1);

    for node in &cluster.nodes {
        node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_preconditions_fail_without_mutation() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.directory_leader().await;
    let members: Vec<u64> = vec![1, 2, 3];
    let coordinator = leader.schema_coordinator();

    coordinator
        .submit(
            SCOPE,
            op(1, 0, ApplyMode::Quorum(2)),
            &members,
            Duration::from_secs(10),
        )
        .await
        .expect("first op");

    // Precondition expects version 7 but the object sits at 1.
    let mut stale = op(2, coordinator.scope_epoch(SCOPE), ApplyMode::Quorum(2));
    stale.preconditions.insert("users".to_string(), 7);
    match coordinator
        .submit(SCOPE, stale, &members, Duration::from_secs(5))
        .await
    {
        Err(ClusterError::VersionConflict {
            object,
            expected,
            actual,
        }) => {
            assert_eq!(object, "users");
            assert_eq!(expected, 7);
            assert_eq!(actual, 1);
        }
        other => panic!("expected VersionConflict, got {other:?}"),
    }

    // Nothing was appended and the version did not move.
    let state = leader.directory().state();
    let log = state.schema_logs.get(SCOPE).unwrap();
    assert_eq!(log.ops.len(), 1);
    assert_eq!(log.versions.get("users"), Some(&1));

    // A submission against a stale scope epoch is rejected as a conflict.
    match coordinator
        .submit(SCOPE, op(3, 0, ApplyMode::Quorum(2)), &members, Duration::from_secs(5))
        .await
    {
        Err(ClusterError::EpochConflict { .. }) => {}
        other => panic!("expected EpochConflict, got {other:?}"),
    }

    for node in &cluster.nodes {
        node.stop();
    }
}
