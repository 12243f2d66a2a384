//! Cross-partition transactions: unanimous commit, single-veto abort.

mod common;

use common::TestCluster;
use tessera_cluster::directory::MapKey;
use tessera_cluster::namespace::Namespace;
use tessera_cluster::partition::WriteOp;
use tessera_cluster::router::ReadSession;
use tessera_cluster::transport::ReadPolicy;
use tessera_cluster::txn::{TxnBranch, TxnOutcome};

/// Find two routing keys that land on different partitions.
fn split_keys(desc: &tessera_cluster::namespace::NamespaceDesc) -> (Vec<u8>, Vec<u8>) {
    let first = b"alpha".to_vec();
    let p0 = desc.compute_partition(&first);
    for i in 0..1000u32 {
        let candidate = format!("beta{i}").into_bytes();
        if desc.compute_partition(&candidate) != p0 {
            return (first, candidate);
        }
    }
    panic!("could not find keys on distinct partitions");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unanimous_votes_commit_across_partitions() {
    let cluster = TestCluster::start(3).await;
    cluster.create_object(Namespace::Table, "ledger", 4).await;
    let key = MapKey::new(Namespace::Table, "ledger");
    let map = cluster.shard_map(Namespace::Table, "ledger").await;
    let (ka, kb) = split_keys(&map.desc);

    let node = &cluster.nodes[0];
    let outcome = node
        .txn_coordinator()
        .execute(
            "tester",
            vec![
                TxnBranch {
                    key: key.clone(),
                    routing_key: ka.clone(),
                    writes: vec![WriteOp::Put {
                        key: ka.clone(),
                        value: b"10".to_vec(),
                    }],
                },
                TxnBranch {
                    key: key.clone(),
                    routing_key: kb.clone(),
                    writes: vec![WriteOp::Put {
                        key: kb.clone(),
                        value: b"20".to_vec(),
                    }],
                },
            ],
        )
        .await
        .expect("transaction ran");
    assert_eq!(outcome, TxnOutcome::Committed);

    let mut session = ReadSession::default();
    for (k, expected) in [(ka, b"10".as_slice()), (kb, b"20".as_slice())] {
        let row = node
            .router()
            .get("tester", &key, &k, ReadPolicy::Strong, &mut session)
            .await
            .unwrap()
            .expect("committed row visible");
        assert_eq!(row.value, expected);
    }

    for node in &cluster.nodes {
        node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_abort_vote_aborts_everywhere() {
    let cluster = TestCluster::start(3).await;
    cluster.create_object(Namespace::Table, "ledger", 4).await;
    let key = MapKey::new(Namespace::Table, "ledger");
    let map = cluster.shard_map(Namespace::Table, "ledger").await;
    let (ka, kb) = split_keys(&map.desc);

    let node = &cluster.nodes[0];
    // Seed kb so its stored version is a real log index.
    node.router()
        .write(
            "tester",
            &key,
            &kb,
            vec![WriteOp::Put {
                key: kb.clone(),
                value: b"base".to_vec(),
            }],
        )
        .await
        .expect("seed write");

    // P1 stages a clean put (commit vote); P2's precondition is stale, so
    // it votes abort and the whole transaction aborts.
    let outcome = node
        .txn_coordinator()
        .execute(
            "tester",
            vec![
                TxnBranch {
                    key: key.clone(),
                    routing_key: ka.clone(),
                    writes: vec![WriteOp::Put {
                        key: ka.clone(),
                        value: b"orphan".to_vec(),
                    }],
                },
                TxnBranch {
                    key: key.clone(),
                    routing_key: kb.clone(),
                    writes: vec![WriteOp::PutIf {
                        key: kb.clone(),
                        value: b"conflict".to_vec(),
                        expected_version: u64::MAX,
                    }],
                },
            ],
        )
        .await
        .expect("transaction ran");
    assert_eq!(outcome, TxnOutcome::Aborted);

    // Neither partition's derived state reflects the transaction.
    let mut session = ReadSession::default();
    let a = node
        .router()
        .get("tester", &key, &ka, ReadPolicy::Strong, &mut session)
        .await
        .unwrap();
    assert!(a.is_none(), "aborted write leaked: {a:?}");
    let b = node
        .router()
        .get("tester", &key, &kb, ReadPolicy::Strong, &mut session)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.value, b"base");

    for node in &cluster.nodes {
        node.stop();
    }
}
