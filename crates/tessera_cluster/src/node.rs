//! Node assembly and background loops.
//!
//! A `Node` runs the directory group plus one consensus group per locally
//! hosted partition, each on its own sequential apply path. Background
//! loops handle heartbeats and lease renewal, shard-map-driven partition
//! lifecycle, leadership reporting (which bumps partition epochs on
//! failover), snapshot triggering, and rebalancing on the directory leader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use tessera_raft::raft::{
    Config as RaftConfig, Group, GroupId, Handle, LogIndex, LogStore, Membership, MemLogStore,
    NodeId, Role, StateMachine, SyncPolicy, Transport,
};

use crate::auth::AuthGate;
use crate::directory::{
    Directory, DirectoryCommand, DirectoryStateMachine, DirectoryStore, FailureDomain, MemberState,
    NodeRecord, PartitionEntry, DIRECTORY_GROUP,
};
use crate::error::{ClusterError, Result};
use crate::map_cache::ShardMapCache;
use crate::partition::{
    DataCommand, FjallStoreEngine, MemEngine, PartitionStateMachine, StoreEngine, TxnId, Vote,
};
use crate::placement::PlacementPolicy;
use crate::rebalance::{self, RebalanceConfig};
use crate::router::{Router, RouterConfig};
use crate::schema::{self, SchemaCatalog, SchemaCoordinator};
use crate::snapshot;
use crate::transport::{
    DataClient, LocalMesh, NodeHandler, ReadKind, ReadPolicy, ReadRequest, ReadResponse, WriteAck,
};
use crate::txn::{FileTxnStore, MemTxnStore, TxnCoordinator, TxnCoordinatorConfig, TxnStore};
use crate::wal::{FileWal, WalConfig};

/// Per-node configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub addr: String,
    pub domain: FailureDomain,
    /// 0 means probe the machine for a capacity hint.
    pub capacity_slots: u64,
    /// Voter set of the directory group.
    pub directory_members: Vec<NodeId>,
    /// Durable state root; `None` runs fully in memory.
    pub data_dir: Option<PathBuf>,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Retained log entries before a snapshot+compaction pass.
    pub snapshot_threshold: u64,
    pub snapshot_keep: usize,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub raft_heartbeat_interval: Duration,
    pub sync_policy: SyncPolicy,
    pub placement: PlacementPolicy,
    pub router: RouterConfig,
    pub map_cache_ttl: Duration,
    pub rebalance: RebalanceConfig,
}

impl NodeConfig {
    pub fn new(node_id: NodeId, directory_members: Vec<NodeId>) -> Self {
        Self {
            node_id,
            addr: format!("mem://{node_id}"),
            domain: FailureDomain {
                zone: format!("z{node_id}"),
                rack: format!("r{node_id}"),
                host: format!("h{node_id}"),
            },
            capacity_slots: 0,
            directory_members,
            data_dir: None,
            lease_ttl: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(1),
            snapshot_threshold: 1024,
            snapshot_keep: 2,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            raft_heartbeat_interval: Duration::from_millis(50),
            sync_policy: SyncPolicy::GroupCommit,
            placement: PlacementPolicy::default(),
            router: RouterConfig::default(),
            map_cache_ttl: Duration::from_secs(5),
            rebalance: RebalanceConfig::default(),
        }
    }
}

struct LocalPartition {
    group: Arc<Group>,
    sm: Arc<PartitionStateMachine>,
    log: Arc<dyn LogStore>,
}

/// One cluster node.
pub struct Node {
    config: NodeConfig,
    mesh: Arc<LocalMesh>,
    directory: Directory,
    dir_group: Arc<Group>,
    dir_log: Arc<dyn LogStore>,
    keyspace: Option<fjall::Keyspace>,
    partitions: RwLock<HashMap<GroupId, Arc<LocalPartition>>>,
    schema_catalog: Arc<SchemaCatalog>,
    cache: Arc<ShardMapCache>,
    router: Arc<Router>,
    txn: Arc<TxnCoordinator>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Node {
    pub fn new(config: NodeConfig, mesh: Arc<LocalMesh>) -> anyhow::Result<Arc<Self>> {
        let dir_store = DirectoryStore::new();
        let dir_sm = Arc::new(DirectoryStateMachine::new(Arc::clone(&dir_store)));

        let keyspace = match &config.data_dir {
            Some(root) => {
                let keyspace = fjall::Config::new(root.join("store"))
                    .open()
                    .context("open fjall keyspace")?;
                Some(keyspace)
            }
            None => None,
        };

        let dir_log: Arc<dyn LogStore> = match &config.data_dir {
            Some(root) => {
                if let Some((meta, body)) =
                    snapshot::latest_snapshot(root.join("snapshots"), DIRECTORY_GROUP)?
                {
                    dir_sm
                        .restore(meta.covered_index, &body)
                        .context("restore directory snapshot")?;
                }
                FileWal::open_dir(
                    root.join(format!("wal_{DIRECTORY_GROUP}")),
                    WalConfig::default(),
                )?
            }
            None => Arc::new(MemLogStore::new()),
        };

        let mut raft_cfg = RaftConfig::new(
            DIRECTORY_GROUP,
            config.node_id,
            Membership::new(config.directory_members.clone(), Vec::new()),
        );
        raft_cfg.election_timeout_min = config.election_timeout_min;
        raft_cfg.election_timeout_max = config.election_timeout_max;
        raft_cfg.heartbeat_interval = config.raft_heartbeat_interval;
        raft_cfg.sync_policy = config.sync_policy;

        let transport: Arc<dyn Transport> = Arc::clone(&mesh) as Arc<dyn Transport>;
        let dir_group = Group::new(raft_cfg, transport, dir_sm, Arc::clone(&dir_log))?;
        let directory = Directory::new(Handle::new(Arc::clone(&dir_group)), dir_store);

        let cache = ShardMapCache::new(directory.clone(), config.map_cache_ttl);
        let client: Arc<dyn DataClient> = Arc::clone(&mesh) as Arc<dyn DataClient>;
        let router = Arc::new(Router::new(
            Arc::clone(&cache),
            Arc::clone(&client),
            AuthGate::allow_all(),
            config.router,
        ));

        let txn_store: Arc<dyn TxnStore> = match &config.data_dir {
            Some(root) => FileTxnStore::open_dir(root.join("txns"))?,
            None => MemTxnStore::new(),
        };
        let txn = TxnCoordinator::new(
            config.node_id,
            txn_store,
            Arc::clone(&router),
            Arc::clone(&cache),
            AuthGate::allow_all(),
            TxnCoordinatorConfig::default(),
        );

        let node = Arc::new(Self {
            config,
            mesh: Arc::clone(&mesh),
            directory,
            dir_group,
            dir_log,
            keyspace,
            partitions: RwLock::new(HashMap::new()),
            schema_catalog: SchemaCatalog::new(),
            cache,
            router,
            txn,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let weak: Weak<dyn NodeHandler> = Arc::downgrade(&node) as Weak<dyn NodeHandler>;
        mesh.register(node.config.node_id, weak);
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn txn_coordinator(&self) -> &Arc<TxnCoordinator> {
        &self.txn
    }

    pub fn schema_coordinator(&self) -> SchemaCoordinator {
        SchemaCoordinator::new(self.directory.clone())
    }

    pub fn schema_catalog(&self) -> &Arc<SchemaCatalog> {
        &self.schema_catalog
    }

    pub fn admin(&self) -> crate::admin::AdminApi {
        crate::admin::AdminApi::new(
            self.directory.clone(),
            Arc::clone(&self.mesh) as Arc<dyn DataClient>,
            self.config.placement,
        )
    }

    /// Start consensus and all background loops.
    pub fn start(self: &Arc<Self>) {
        self.dir_group.start();

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.cache.spawn_refresh());
        tasks.push(schema::spawn_applier(
            self.directory.clone(),
            self.config.node_id,
            Arc::clone(&self.schema_catalog),
            Arc::clone(&self.mesh) as Arc<dyn DataClient>,
        ));
        tasks.push(self.spawn_partition_reconciler());
        tasks.push(self.spawn_heartbeat_loop());
        tasks.push(self.spawn_lease_sweep());
        tasks.push(self.spawn_leadership_reporter());
        tasks.push(self.spawn_snapshot_loop());
        tasks.push(rebalance::spawn(
            self.directory.clone(),
            Arc::clone(&self.mesh) as Arc<dyn DataClient>,
            self.config.placement,
            self.config.rebalance,
        ));

        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            if let Ok(resumed) = node.txn.recover().await {
                if resumed > 0 {
                    tracing::info!(resumed, "resumed in-flight transactions");
                }
            }
        }));
    }

    /// Stop all loops and consensus groups. The node stays registered on
    /// the mesh but refuses further work.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.dir_group.stop();
        for part in self.partitions.read().unwrap().values() {
            part.group.stop();
        }
    }

    // ------------------------------------------------------------------
    // Partition lifecycle
    // ------------------------------------------------------------------

    fn spawn_partition_reconciler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut watch = node.directory.watch_all();
            loop {
                if let Err(err) = node.reconcile_local_partitions().await {
                    tracing::warn!(node = node.config.node_id, error = ?err,
                        "partition reconcile failed");
                }
                match watch.recv().await {
                    crate::directory::WatchItem::Closed => return,
                    _ => {}
                }
            }
        })
    }

    async fn reconcile_local_partitions(self: &Arc<Self>) -> anyhow::Result<()> {
        let state = self.directory.state();
        let self_id = self.config.node_id;

        let mut desired: HashMap<GroupId, PartitionEntry> = HashMap::new();
        for map in state.maps.values() {
            for entry in &map.entries {
                if entry.replicas.contains(&self_id) || entry.non_voters.contains(&self_id) {
                    desired.insert(entry.group_id, entry.clone());
                }
            }
        }

        let (to_add, to_remove, to_update) = {
            let parts = self.partitions.read().unwrap();
            let to_add: Vec<PartitionEntry> = desired
                .values()
                .filter(|e| !parts.contains_key(&e.group_id))
                .cloned()
                .collect();
            let to_remove: Vec<GroupId> = parts
                .keys()
                .filter(|gid| !desired.contains_key(gid))
                .copied()
                .collect();
            let to_update: Vec<(Arc<Group>, u64)> = desired
                .values()
                .filter_map(|e| parts.get(&e.group_id).map(|p| (Arc::clone(&p.group), e.epoch)))
                .collect();
            (to_add, to_remove, to_update)
        };

        for (group, epoch) in to_update {
            group.install_epoch(epoch).await;
        }

        for entry in to_add {
            let part = self.create_partition(&entry)?;
            part.group.install_epoch(entry.epoch).await;
            part.group.start();
            tracing::info!(node = self_id, group = entry.group_id, partition = entry.partition,
                "partition replica started");
            self.partitions
                .write()
                .unwrap()
                .insert(entry.group_id, part);
        }

        for gid in to_remove {
            if let Some(part) = self.partitions.write().unwrap().remove(&gid) {
                part.group.stop();
                tracing::info!(node = self_id, group = gid, "partition replica retired");
            }
        }
        Ok(())
    }

    fn create_partition(&self, entry: &PartitionEntry) -> anyhow::Result<Arc<LocalPartition>> {
        let engine: Arc<dyn StoreEngine> = match &self.keyspace {
            Some(keyspace) => Arc::new(FjallStoreEngine::open(keyspace, entry.group_id)?),
            None => MemEngine::new(),
        };
        let sm = PartitionStateMachine::new(entry.group_id, engine);

        let log: Arc<dyn LogStore> = match &self.config.data_dir {
            Some(root) => {
                if let Some((meta, body)) =
                    snapshot::latest_snapshot(root.join("snapshots"), entry.group_id)?
                {
                    sm.restore(meta.covered_index, &body)
                        .context("restore partition snapshot")?;
                }
                FileWal::open_dir(
                    root.join(format!("wal_{}", entry.group_id)),
                    WalConfig::default(),
                )?
            }
            None => Arc::new(MemLogStore::new()),
        };

        let mut raft_cfg = RaftConfig::new(
            entry.group_id,
            self.config.node_id,
            Membership::new(entry.replicas.clone(), entry.non_voters.clone()),
        );
        raft_cfg.election_timeout_min = self.config.election_timeout_min;
        raft_cfg.election_timeout_max = self.config.election_timeout_max;
        raft_cfg.heartbeat_interval = self.config.raft_heartbeat_interval;
        raft_cfg.sync_policy = self.config.sync_policy;

        let transport: Arc<dyn Transport> = Arc::clone(&self.mesh) as Arc<dyn Transport>;
        let sm_dyn: Arc<dyn tessera_raft::raft::StateMachine> = Arc::clone(&sm) as _;
        let group = Group::new(raft_cfg, transport, sm_dyn, Arc::clone(&log))?;
        Ok(Arc::new(LocalPartition { group, sm, log }))
    }

    fn partition(&self, group_id: GroupId) -> Result<Arc<LocalPartition>> {
        self.partitions
            .read()
            .unwrap()
            .get(&group_id)
            .cloned()
            .ok_or_else(|| ClusterError::QuorumUnavailable {
                reason: format!(
                    "node {} hosts no replica of group {group_id}",
                    self.config.node_id
                ),
            })
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Route a directory command to the current directory leader.
    async fn propose_via_leader(&self, cmd: DirectoryCommand) -> Result<LogIndex> {
        let status = self.dir_group.status().await;
        match status.leader {
            Some(leader) if leader != self.config.node_id => {
                (Arc::clone(&self.mesh) as Arc<dyn DataClient>)
                    .dir_propose(leader, cmd)
                    .await
            }
            _ => self.directory.propose(&cmd).await,
        }
    }

    fn probe_capacity(&self) -> u64 {
        if self.config.capacity_slots > 0 {
            return self.config.capacity_slots;
        }
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        (sys.total_memory() / (1024 * 1024 * 1024)).max(1)
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let record = NodeRecord {
                node_id: node.config.node_id,
                addr: node.config.addr.clone(),
                domain: node.config.domain.clone(),
                capacity_slots: node.probe_capacity(),
                load_slots: 0,
                version: env!("CARGO_PKG_VERSION").to_string(),
                state: MemberState::Active,
                lease_expires_unix_ms: 0,
            };
            let mut registered = false;
            let mut ticker = tokio::time::interval(node.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !registered {
                    match node
                        .propose_via_leader(DirectoryCommand::RegisterNode {
                            record: record.clone(),
                        })
                        .await
                    {
                        Ok(_) => registered = true,
                        Err(err) => {
                            tracing::debug!(node = node.config.node_id, error = %err,
                                "registration not yet accepted");
                            continue;
                        }
                    }
                }
                let load = node.partitions.read().unwrap().len() as u64;
                let cmd = DirectoryCommand::Heartbeat {
                    node_id: node.config.node_id,
                    now_ms: crate::unix_time_ms(),
                    ttl_ms: node.config.lease_ttl.as_millis().min(u128::from(u64::MAX)) as u64,
                    load_slots: load,
                };
                if let Err(err) = node.propose_via_leader(cmd).await {
                    tracing::debug!(node = node.config.node_id, error = %err, "heartbeat missed");
                }
            }
        })
    }

    /// Lease expiry runs only on the directory leader; observers never act
    /// on expiry locally.
    fn spawn_lease_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.lease_ttl);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !node.directory.is_leader().await {
                    continue;
                }
                let cmd = DirectoryCommand::ExpireLeases {
                    now_ms: crate::unix_time_ms(),
                };
                if let Err(err) = node.directory.propose(&cmd).await {
                    tracing::debug!(error = %err, "lease sweep proposal failed");
                }
            }
        })
    }

    /// When this node leads a partition but the shard map says otherwise,
    /// report it. The transition bumps the entry epoch, which is exactly the
    /// strictly-increasing-epoch-per-leader-change invariant.
    fn spawn_leadership_reporter(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let parts: Vec<(GroupId, Arc<Group>)> = node
                    .partitions
                    .read()
                    .unwrap()
                    .iter()
                    .map(|(gid, p)| (*gid, Arc::clone(&p.group)))
                    .collect();
                let state = node.directory.state();
                for (gid, group) in parts {
                    let status = group.status().await;
                    if status.role != Role::Leader {
                        continue;
                    }
                    let located = state.maps.iter().find_map(|(key, map)| {
                        map.entries
                            .iter()
                            .find(|e| e.group_id == gid)
                            .map(|e| (key.clone(), e.clone()))
                    });
                    let Some((key, entry)) = located else { continue };
                    if entry.leader == Some(node.config.node_id) {
                        continue;
                    }
                    let cmd = DirectoryCommand::Transition {
                        key,
                        partition: entry.partition,
                        expected_epoch: entry.epoch,
                        replicas: entry.replicas.clone(),
                        non_voters: entry.non_voters.clone(),
                        leader: Some(node.config.node_id),
                    };
                    if let Err(err) = node.propose_via_leader(cmd).await {
                        tracing::debug!(group = gid, error = %err,
                            "leadership report not accepted yet");
                    }
                }
            }
        })
    }

    fn spawn_snapshot_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = node.snapshot_pass().await {
                    tracing::warn!(node = node.config.node_id, error = ?err, "snapshot pass failed");
                }
            }
        })
    }

    async fn snapshot_pass(&self) -> anyhow::Result<()> {
        let mut targets: Vec<(GroupId, Arc<Group>, Arc<dyn LogStore>)> = vec![(
            DIRECTORY_GROUP,
            Arc::clone(&self.dir_group),
            Arc::clone(&self.dir_log),
        )];
        {
            let parts = self.partitions.read().unwrap();
            for (gid, part) in parts.iter() {
                targets.push((*gid, Arc::clone(&part.group), Arc::clone(&part.log)));
            }
        }

        for (gid, group, log) in targets {
            let (compacted, _) = log.compacted();
            let retained = log.last_index().saturating_sub(compacted);
            if retained < self.config.snapshot_threshold {
                continue;
            }
            let (index, term, data) = group.snapshot_now().await?;
            if index <= compacted {
                continue;
            }
            if let Some(root) = &self.config.data_dir {
                let snap_dir = root.join("snapshots");
                snapshot::write_snapshot(&snap_dir, gid, index, term, &data)?;
                snapshot::gc_snapshots(&snap_dir, gid, self.config.snapshot_keep)?;
            }
            group.compact(index).await?;
            tracing::info!(node = self.config.node_id, group = gid, index,
                "snapshot taken and log compacted");
        }
        Ok(())
    }
}

#[async_trait]
impl NodeHandler for Node {
    fn raft_group(&self, group_id: GroupId) -> Option<Arc<Group>> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        if group_id == DIRECTORY_GROUP {
            return Some(Arc::clone(&self.dir_group));
        }
        self.partitions
            .read()
            .unwrap()
            .get(&group_id)
            .map(|p| Arc::clone(&p.group))
    }

    async fn handle_write(
        &self,
        group_id: GroupId,
        epoch: u64,
        command: DataCommand,
    ) -> Result<WriteAck> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClusterError::QuorumUnavailable {
                reason: format!("node {} stopped", self.config.node_id),
            });
        }
        let part = self.partition(group_id)?;
        let prepare_txn = match &command {
            DataCommand::TxnPrepare { txn_id, .. } => Some(*txn_id),
            _ => None,
        };
        let payload = command.encode().map_err(ClusterError::Internal)?;
        let commit_index = part.group.propose(payload, Some(epoch)).await?;
        let status = part.group.status().await;
        let txn_vote = prepare_txn.and_then(|txn_id| part.sm.vote_of(txn_id));
        Ok(WriteAck {
            commit_index,
            epoch: status.routing_epoch,
            txn_vote,
        })
    }

    async fn handle_read(&self, group_id: GroupId, req: ReadRequest) -> Result<ReadResponse> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClusterError::QuorumUnavailable {
                reason: format!("node {} stopped", self.config.node_id),
            });
        }
        let part = self.partition(group_id)?;

        let applied_index = match req.policy {
            ReadPolicy::Strong => {
                // Linearizable barrier: commit index captured, leadership
                // confirmed, apply caught up past the barrier.
                part.group.read_index().await?
            }
            ReadPolicy::Timeline => {
                let applied = part.group.applied_index().await;
                if applied < req.min_applied {
                    // This replica is behind the session floor; the router
                    // retries another replica rather than regressing.
                    return Err(ClusterError::Timeout);
                }
                applied
            }
            ReadPolicy::Eventual => part.group.applied_index().await,
        };

        let rows = match &req.kind {
            ReadKind::Get { key } => part.sm.engine().get(key).into_iter().collect(),
            ReadKind::Scan { start, end, limit } => part.sm.engine().scan(start, end, *limit),
        };
        let status = part.group.status().await;
        Ok(ReadResponse {
            rows,
            applied_index,
            epoch: status.routing_epoch,
        })
    }

    async fn handle_dir_propose(&self, cmd: DirectoryCommand) -> Result<LogIndex> {
        self.directory.propose(&cmd).await
    }

    async fn handle_reconfigure(&self, group_id: GroupId, membership: Membership) -> Result<()> {
        let group = self
            .raft_group(group_id)
            .ok_or_else(|| ClusterError::QuorumUnavailable {
                reason: format!("group {group_id} not hosted here"),
            })?;
        group.change_membership(membership).await?;
        Ok(())
    }

    async fn handle_transfer_leader(&self, group_id: GroupId, target: NodeId) -> Result<()> {
        let group = self
            .raft_group(group_id)
            .ok_or_else(|| ClusterError::QuorumUnavailable {
                reason: format!("group {group_id} not hosted here"),
            })?;
        group.transfer_leadership(target).await?;
        Ok(())
    }

    async fn handle_applied_index(&self, group_id: GroupId) -> Result<LogIndex> {
        let group = self
            .raft_group(group_id)
            .ok_or_else(|| ClusterError::QuorumUnavailable {
                reason: format!("group {group_id} not hosted here"),
            })?;
        Ok(group.applied_index().await)
    }

    async fn handle_txn_vote(&self, group_id: GroupId, txn_id: TxnId) -> Result<Option<Vote>> {
        let part = self.partition(group_id)?;
        Ok(part.sm.vote_of(txn_id))
    }
}
