//! Shared helpers for integration tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tessera_cluster::directory::{MapKey, ShardMap};
use tessera_cluster::namespace::Namespace;
use tessera_cluster::node::{Node, NodeConfig};
use tessera_cluster::transport::LocalMesh;
use tessera_raft::raft::NodeId;

/// Upper bound for cluster convergence waits.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(20);

pub struct TestCluster {
    pub mesh: Arc<LocalMesh>,
    pub nodes: Vec<Arc<Node>>,
}

impl TestCluster {
    pub async fn start(count: usize) -> Self {
        Self::start_with(count, |_| {}).await
    }

    pub async fn start_with(count: usize, tune: impl Fn(&mut NodeConfig)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
        let mesh = LocalMesh::new(Duration::from_millis(800));
        let members: Vec<NodeId> = (1..=count as NodeId).collect();
        let mut nodes = Vec::new();
        for id in 1..=count as NodeId {
            let mut cfg = NodeConfig::new(id, members.clone());
            cfg.heartbeat_interval = Duration::from_millis(200);
            cfg.lease_ttl = Duration::from_millis(1500);
            cfg.map_cache_ttl = Duration::from_millis(300);
            cfg.rebalance.interval = Duration::from_millis(300);
            cfg.capacity_slots = 100;
            tune(&mut cfg);
            let node = Node::new(cfg, Arc::clone(&mesh)).expect("node construction");
            node.start();
            nodes.push(node);
        }
        let cluster = Self { mesh, nodes };
        cluster.wait_registered(count).await;
        cluster
    }

    pub fn node(&self, node_id: NodeId) -> &Arc<Node> {
        self.nodes
            .iter()
            .find(|n| n.node_id() == node_id)
            .expect("node id present")
    }

    /// The node currently leading the directory group.
    pub async fn directory_leader(&self) -> Arc<Node> {
        let found = wait_until(CONVERGE_TIMEOUT, || async {
            for node in &self.nodes {
                if self.mesh.is_down(node.node_id()) {
                    continue;
                }
                if node.directory().is_leader().await {
                    return Some(Arc::clone(node));
                }
            }
            None
        })
        .await;
        found.expect("directory leader elected")
    }

    pub async fn wait_registered(&self, count: usize) {
        let leader = self.directory_leader().await;
        let ok = wait_until(CONVERGE_TIMEOUT, || async {
            (leader.directory().state().nodes.len() >= count).then_some(())
        })
        .await;
        assert!(ok.is_some(), "nodes failed to register");
    }

    /// Create an object and wait until every partition has an elected,
    /// reported leader.
    pub async fn create_object(&self, namespace: Namespace, object: &str, partitions: u32) {
        let leader = self.directory_leader().await;
        leader
            .admin()
            .create_object(namespace, object, partitions)
            .await
            .expect("create object");
        self.wait_partition_leaders(namespace, object).await;
    }

    pub async fn shard_map(&self, namespace: Namespace, object: &str) -> ShardMap {
        let leader = self.directory_leader().await;
        leader
            .directory()
            .store()
            .shard_map(&MapKey::new(namespace, object))
            .expect("shard map exists")
    }

    /// Wait for every partition entry to have a live leader that has caught
    /// up with the map's epoch.
    pub async fn wait_partition_leaders(&self, namespace: Namespace, object: &str) {
        let dir_leader = self.directory_leader().await;
        let key = MapKey::new(namespace, object);
        let ok = wait_until(CONVERGE_TIMEOUT, || {
            let dir_leader = Arc::clone(&dir_leader);
            let key = key.clone();
            async move {
                let map = dir_leader.directory().store().shard_map(&key)?;
                for entry in &map.entries {
                    let leader = entry.leader?;
                    if self.mesh.is_down(leader) {
                        return None;
                    }
                }
                Some(())
            }
        })
        .await;
        assert!(ok.is_some(), "partition leaders failed to converge");
        // Let epoch installs propagate to replicas.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    /// Crash one node: stops its groups and drops it from the mesh.
    pub fn kill(&self, node_id: NodeId) {
        self.node(node_id).stop();
        self.mesh.set_down(node_id, true);
    }
}

/// Poll `f` until it yields `Some`, or give up after `timeout`.
pub async fn wait_until<T, F, Fut>(timeout: Duration, mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = f().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
