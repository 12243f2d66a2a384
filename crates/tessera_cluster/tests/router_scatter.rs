//! Scatter/gather reads: pruning, ordered merge, limits, session
//! monotonicity, and hedged reads.

mod common;

use std::time::Duration;

use common::TestCluster;
use tessera_cluster::directory::MapKey;
use tessera_cluster::namespace::{MergeContract, Namespace, Pruning};
use tessera_cluster::partition::WriteOp;
use tessera_cluster::router::{QueryRequest, ReadSession, ScanSpec};
use tessera_cluster::transport::ReadPolicy;

async fn seed(cluster: &TestCluster, key: &MapKey, count: u32) {
    let node = &cluster.nodes[0];
    for i in 0..count {
        let row_key = format!("user{i:03}");
        node.router()
            .write(
                "tester",
                key,
                row_key.as_bytes(),
                vec![WriteOp::Put {
                    key: row_key.clone().into_bytes(),
                    value: format!("v{i}").into_bytes(),
                }],
            )
            .await
            .expect("seed write");
    }
}

fn base_query(key: &MapKey, policy: ReadPolicy) -> QueryRequest {
    QueryRequest {
        key: key.clone(),
        pruning: Pruning::All,
        policy,
        scan: ScanSpec::default(),
        order: None,
        limit: None,
        offset: 0,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_scatter_gather_with_limit_and_offset() {
    let cluster = TestCluster::start(3).await;
    cluster.create_object(Namespace::Table, "users", 4).await;
    let key = MapKey::new(Namespace::Table, "users");
    seed(&cluster, &key, 40).await;

    let node = &cluster.nodes[1];
    let mut session = ReadSession::default();

    // Full ordered scan: table namespaces merge key-sorted.
    let rows = node
        .router()
        .query("tester", &base_query(&key, ReadPolicy::Strong), &mut session)
        .await
        .expect("query");
    assert_eq!(rows.len(), 40);
    let keys: Vec<String> = rows
        .iter()
        .map(|r| String::from_utf8(r.key.clone()).unwrap())
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted, "ordered merge must produce global key order");

    // Global limit/offset across partitions.
    let mut limited = base_query(&key, ReadPolicy::Strong);
    limited.offset = 5;
    limited.limit = Some(7);
    let page = node
        .router()
        .query("tester", &limited, &mut session)
        .await
        .expect("query");
    assert_eq!(page.len(), 7);
    assert_eq!(page[0].key, keys[5].as_bytes());

    // Merging the same inputs twice yields the identical result set.
    let again = node
        .router()
        .query("tester", &limited, &mut session)
        .await
        .expect("query");
    assert_eq!(page, again);

    for node in &cluster.nodes {
        node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn key_pruning_narrows_fanout_to_matching_rows() {
    let cluster = TestCluster::start(3).await;
    cluster.create_object(Namespace::Table, "users", 4).await;
    let key = MapKey::new(Namespace::Table, "users");
    seed(&cluster, &key, 20).await;

    let node = &cluster.nodes[2];
    let wanted = vec![b"user003".to_vec(), b"user017".to_vec()];
    let mut req = base_query(&key, ReadPolicy::Strong);
    req.pruning = Pruning::Keys(wanted.clone());
    let rows = node
        .router()
        .query("tester", &req, &mut ReadSession::default())
        .await
        .expect("query");
    for want in &wanted {
        assert!(
            rows.iter().any(|r| &r.key == want),
            "pruned query lost {}",
            String::from_utf8_lossy(want)
        );
    }

    for node in &cluster.nodes {
        node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeline_sessions_never_regress() {
    let cluster = TestCluster::start(3).await;
    cluster.create_object(Namespace::Table, "users", 2).await;
    let key = MapKey::new(Namespace::Table, "users");
    seed(&cluster, &key, 10).await;

    let node = &cluster.nodes[0];
    let map = cluster.shard_map(Namespace::Table, "users").await;
    let mut session = ReadSession::default();

    let first = node
        .router()
        .query("tester", &base_query(&key, ReadPolicy::Timeline), &mut session)
        .await
        .expect("timeline query");
    assert_eq!(first.len(), 10);
    let floors_after_first: Vec<u64> = map
        .entries
        .iter()
        .map(|e| session.floor(e.group_id))
        .collect();
    assert!(floors_after_first.iter().any(|f| *f > 0));

    seed(&cluster, &key, 12).await;
    // Followers may lag the new rows briefly; poll until the session
    // observes all of them, checking monotonicity on every pass.
    let second = common::wait_until(common::CONVERGE_TIMEOUT, || {
        let mut session = session.clone();
        let key = key.clone();
        async move {
            let rows = node
                .router()
                .query("tester", &base_query(&key, ReadPolicy::Timeline), &mut session)
                .await
                .ok()?;
            (rows.len() == 12).then_some(rows)
        }
    })
    .await
    .expect("timeline query converged");
    assert_eq!(second.len(), 12);
    let second_pass = node
        .router()
        .query("tester", &base_query(&key, ReadPolicy::Timeline), &mut session)
        .await
        .expect("timeline query");
    assert!(second_pass.len() >= 10);
    for (entry, before) in map.entries.iter().zip(floors_after_first) {
        assert!(
            session.floor(entry.group_id) >= before,
            "session floor regressed on group {}",
            entry.group_id
        );
    }

    for node in &cluster.nodes {
        node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hedged_reads_still_return_correct_rows() {
    let cluster = TestCluster::start_with(3, |cfg| {
        cfg.router.hedge_threshold = Some(Duration::from_millis(25));
    })
    .await;
    cluster.create_object(Namespace::Table, "users", 2).await;
    let key = MapKey::new(Namespace::Table, "users");
    seed(&cluster, &key, 8).await;

    let node = &cluster.nodes[1];
    let mut req = base_query(&key, ReadPolicy::Eventual);
    req.order = Some(MergeContract::OrderedByKey { descending: false });
    let rows = node
        .router()
        .query("tester", &req, &mut ReadSession::default())
        .await
        .expect("hedged query");
    assert_eq!(rows.len(), 8);

    for node in &cluster.nodes {
        node.stop();
    }
}
