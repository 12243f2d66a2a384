//! Shard Directory: control-plane metadata and membership state machine.
//!
//! The directory is itself a consensus group (group 0). Every mutation is a
//! `DirectoryCommand` proposed through that group and applied
//! deterministically on each replica, so all mutating operations carry
//! consensus-level durability before success is reported. Committed
//! transitions are pushed to watchers in epoch order, at least once.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use tessera_raft::raft::{GroupId, Handle, LogIndex, NodeId, StateMachine};

use crate::error::{ClusterError, Result};
use crate::namespace::{Namespace, NamespaceDesc};
use crate::schema::{SchemaLog, SchemaOp};
use crate::unix_time_ms;

/// Consensus group id reserved for the directory itself.
pub const DIRECTORY_GROUP: GroupId = 0;

/// Cluster member state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Active,
    Draining,
    Removed,
}

/// Failure-domain labels attached to a node at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDomain {
    pub zone: String,
    pub rack: String,
    pub host: String,
}

/// Registered node descriptor.
///
/// Relationships to partitions are expressed as id lists on the shard maps,
/// never as embedded references, so node and partition tables stay
/// independently owned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub addr: String,
    pub domain: FailureDomain,
    pub capacity_slots: u64,
    pub load_slots: u64,
    pub version: String,
    pub state: MemberState,
    pub lease_expires_unix_ms: u64,
}

/// Identity of one shard map: a (namespace, object) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapKey {
    pub namespace: Namespace,
    pub object: String,
}

impl MapKey {
    pub fn new(namespace: Namespace, object: impl Into<String>) -> Self {
        Self {
            namespace,
            object: object.into(),
        }
    }

    pub fn scope(&self) -> String {
        format!("{}/{}", self.namespace, self.object)
    }
}

impl std::fmt::Display for MapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.object)
    }
}

/// One partition's placement entry. The epoch strictly increases on every
/// replica-set or leadership change; writers present it and are fenced on
/// mismatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionEntry {
    pub partition: u32,
    pub group_id: GroupId,
    pub replicas: Vec<NodeId>,
    pub non_voters: Vec<NodeId>,
    pub leader: Option<NodeId>,
    pub epoch: u64,
}

/// Ordered partition entries for one (namespace, object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMap {
    pub key: MapKey,
    pub desc: NamespaceDesc,
    pub entries: Vec<PartitionEntry>,
}

impl ShardMap {
    /// Highest entry epoch; watchers order deliveries by it.
    pub fn epoch(&self) -> u64 {
        self.entries.iter().map(|e| e.epoch).max().unwrap_or(0)
    }

    pub fn entry(&self, partition: u32) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.partition == partition)
    }
}

/// Cluster-wide control-plane state replicated through the directory group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryState {
    /// Global mutation counter; bumps on every applied command so watch
    /// deliveries have a total order.
    pub epoch: u64,
    pub frozen: bool,
    pub next_group_id: GroupId,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    // JSON map keys must be strings, so the map table round-trips as pairs.
    #[serde(with = "map_table")]
    pub maps: BTreeMap<MapKey, ShardMap>,
    pub schema_logs: BTreeMap<String, SchemaLog>,
}

mod map_table {
    use super::{MapKey, ShardMap};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        maps: &BTreeMap<MapKey, ShardMap>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        maps.values().collect::<Vec<_>>().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<MapKey, ShardMap>, D::Error> {
        let maps = Vec::<ShardMap>::deserialize(deserializer)?;
        Ok(maps.into_iter().map(|m| (m.key.clone(), m)).collect())
    }
}

impl DirectoryState {
    fn referenced_nodes(&self) -> std::collections::BTreeSet<NodeId> {
        let mut out = std::collections::BTreeSet::new();
        for map in self.maps.values() {
            for entry in &map.entries {
                out.extend(entry.replicas.iter().copied());
                out.extend(entry.non_voters.iter().copied());
            }
        }
        out
    }
}

/// Commands applied to the directory state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirectoryCommand {
    RegisterNode {
        record: NodeRecord,
    },
    Heartbeat {
        node_id: NodeId,
        now_ms: u64,
        ttl_ms: u64,
        load_slots: u64,
    },
    SetNodeState {
        node_id: NodeId,
        state: MemberState,
    },
    /// Expire leases against the proposer's clock. Only the directory leader
    /// proposes this; observers never act on expiry locally.
    ExpireLeases {
        now_ms: u64,
    },
    CreateMap {
        key: MapKey,
        desc: NamespaceDesc,
        replica_sets: Vec<Vec<NodeId>>,
        leaders: Vec<Option<NodeId>>,
    },
    DropMap {
        key: MapKey,
    },
    /// Compare-and-swap on one partition entry. Applies only when the stored
    /// epoch still equals `expected_epoch`, then bumps the epoch.
    Transition {
        key: MapKey,
        partition: u32,
        expected_epoch: u64,
        replicas: Vec<NodeId>,
        non_voters: Vec<NodeId>,
        leader: Option<NodeId>,
    },
    SetFrozen {
        frozen: bool,
    },
    SchemaAppend {
        scope: String,
        op: SchemaOp,
    },
    SchemaReport {
        scope: String,
        node_id: NodeId,
        cursor: u64,
    },
}

/// Watch-stream payloads. At-least-once, in non-decreasing `epoch` order;
/// consumers always keep the highest epoch seen.
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    Map { epoch: u64, map: ShardMap },
    Schema { epoch: u64, scope: String },
    Nodes { epoch: u64 },
    Frozen { epoch: u64, frozen: bool },
}

/// Outcome of one watch receive.
#[derive(Debug)]
pub enum WatchItem {
    Event(DirectoryEvent),
    /// The consumer fell behind and deliveries were dropped; resynchronize
    /// with a full fetch before continuing.
    Lagged,
    Closed,
}

/// Filtered watch over one shard map. Dropping it unsubscribes.
pub struct ShardMapWatch {
    rx: broadcast::Receiver<DirectoryEvent>,
    key: Option<MapKey>,
}

impl ShardMapWatch {
    pub async fn recv(&mut self) -> WatchItem {
        loop {
            match self.rx.recv().await {
                Ok(event) => match (&self.key, &event) {
                    (Some(key), DirectoryEvent::Map { map, .. }) if &map.key != key => continue,
                    _ => return WatchItem::Event(event),
                },
                Err(broadcast::error::RecvError::Lagged(_)) => return WatchItem::Lagged,
                Err(broadcast::error::RecvError::Closed) => return WatchItem::Closed,
            }
        }
    }
}

struct DirectoryInner {
    applied: LogIndex,
    state: DirectoryState,
}

/// Shared state + watch fan-out for the directory group.
///
/// Reads return copies, never live references; readers re-validate staleness
/// through epoch comparison rather than trusting a cached identity.
pub struct DirectoryStore {
    inner: RwLock<DirectoryInner>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl DirectoryStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            inner: RwLock::new(DirectoryInner {
                applied: 0,
                state: DirectoryState {
                    next_group_id: DIRECTORY_GROUP + 1,
                    ..DirectoryState::default()
                },
            }),
            events,
        })
    }

    pub fn state(&self) -> DirectoryState {
        self.inner.read().unwrap().state.clone()
    }

    pub fn applied_index(&self) -> LogIndex {
        self.inner.read().unwrap().applied
    }

    pub fn shard_map(&self, key: &MapKey) -> Option<ShardMap> {
        self.inner.read().unwrap().state.maps.get(key).cloned()
    }

    pub fn watch(&self, key: Option<MapKey>) -> ShardMapWatch {
        ShardMapWatch {
            rx: self.events.subscribe(),
            key,
        }
    }

    fn publish(&self, events: Vec<DirectoryEvent>) {
        for event in events {
            // Send only fails with zero receivers, which is fine.
            let _ = self.events.send(event);
        }
    }

    /// Advance the apply cursor without touching state. Used when a command
    /// cannot be decoded, so replay stays aligned across replicas.
    fn advance_cursor(&self, index: LogIndex) {
        let mut inner = self.inner.write().unwrap();
        if index > inner.applied {
            inner.applied = index;
        }
    }

    /// Apply one committed command. Idempotent per log index.
    fn apply_command(&self, index: LogIndex, cmd: DirectoryCommand) {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.write().unwrap();
            if index <= inner.applied {
                return;
            }
            inner.applied = index;
            let state = &mut inner.state;
            state.epoch += 1;
            let epoch = state.epoch;

            match cmd {
                DirectoryCommand::RegisterNode { record } => {
                    state.nodes.insert(record.node_id, record);
                    out.push(DirectoryEvent::Nodes { epoch });
                }
                DirectoryCommand::Heartbeat {
                    node_id,
                    now_ms,
                    ttl_ms,
                    load_slots,
                } => {
                    if let Some(node) = state.nodes.get_mut(&node_id) {
                        node.lease_expires_unix_ms = now_ms.saturating_add(ttl_ms);
                        node.load_slots = load_slots;
                        if node.state == MemberState::Removed {
                            // A node that came back after lease expiry
                            // re-registers as active.
                            node.state = MemberState::Active;
                            out.push(DirectoryEvent::Nodes { epoch });
                        }
                    }
                }
                DirectoryCommand::SetNodeState { node_id, state: st } => {
                    if let Some(node) = state.nodes.get_mut(&node_id) {
                        node.state = st;
                        out.push(DirectoryEvent::Nodes { epoch });
                    }
                }
                DirectoryCommand::ExpireLeases { now_ms } => {
                    let mut changed = false;
                    for node in state.nodes.values_mut() {
                        if node.state == MemberState::Active
                            && node.lease_expires_unix_ms > 0
                            && node.lease_expires_unix_ms < now_ms
                        {
                            node.state = MemberState::Removed;
                            changed = true;
                        }
                    }
                    let referenced = state.referenced_nodes();
                    let before = state.nodes.len();
                    state
                        .nodes
                        .retain(|id, n| n.state != MemberState::Removed || referenced.contains(id));
                    if changed || state.nodes.len() != before {
                        out.push(DirectoryEvent::Nodes { epoch });
                    }
                }
                DirectoryCommand::CreateMap {
                    key,
                    desc,
                    replica_sets,
                    leaders,
                } => {
                    if !state.maps.contains_key(&key) {
                        let mut entries = Vec::with_capacity(replica_sets.len());
                        for (partition, replicas) in replica_sets.into_iter().enumerate() {
                            let group_id = state.next_group_id;
                            state.next_group_id += 1;
                            entries.push(PartitionEntry {
                                partition: partition as u32,
                                group_id,
                                replicas,
                                non_voters: Vec::new(),
                                leader: leaders.get(partition).copied().flatten(),
                                epoch: 1,
                            });
                        }
                        let map = ShardMap {
                            key: key.clone(),
                            desc,
                            entries,
                        };
                        state.maps.insert(key, map.clone());
                        out.push(DirectoryEvent::Map { epoch, map });
                    }
                }
                DirectoryCommand::DropMap { key } => {
                    if let Some(mut map) = state.maps.remove(&key) {
                        map.entries.clear();
                        out.push(DirectoryEvent::Map { epoch, map });
                    }
                }
                DirectoryCommand::Transition {
                    key,
                    partition,
                    expected_epoch,
                    replicas,
                    non_voters,
                    leader,
                } => {
                    if let Some(map) = state.maps.get_mut(&key) {
                        if let Some(entry) =
                            map.entries.iter_mut().find(|e| e.partition == partition)
                        {
                            if entry.epoch == expected_epoch {
                                entry.replicas = replicas;
                                entry.non_voters = non_voters;
                                entry.leader = leader;
                                entry.epoch += 1;
                                let map = map.clone();
                                out.push(DirectoryEvent::Map { epoch, map });
                            }
                            // Stale expected epoch: skip silently; the
                            // proposer detects the miss by reading back.
                        }
                    }
                }
                DirectoryCommand::SetFrozen { frozen } => {
                    state.frozen = frozen;
                    out.push(DirectoryEvent::Frozen { epoch, frozen });
                }
                DirectoryCommand::SchemaAppend { scope, op } => {
                    let log = state.schema_logs.entry(scope.clone()).or_default();
                    if log.try_append(op) {
                        out.push(DirectoryEvent::Schema { epoch, scope });
                    }
                }
                DirectoryCommand::SchemaReport {
                    scope,
                    node_id,
                    cursor,
                } => {
                    let log = state.schema_logs.entry(scope.clone()).or_default();
                    if log.report_cursor(node_id, cursor) {
                        out.push(DirectoryEvent::Schema { epoch, scope });
                    }
                }
            }
        }
        self.publish(out);
    }
}

/// Raft state machine adapter for the directory store.
pub struct DirectoryStateMachine {
    store: Arc<DirectoryStore>,
}

impl DirectoryStateMachine {
    pub fn new(store: Arc<DirectoryStore>) -> Self {
        Self { store }
    }
}

impl StateMachine for DirectoryStateMachine {
    fn apply(&self, index: LogIndex, command: &[u8]) {
        match serde_json::from_slice::<DirectoryCommand>(command) {
            Ok(cmd) => self.store.apply_command(index, cmd),
            Err(err) => {
                tracing::warn!(index, error = ?err, "undecodable directory command skipped");
                self.store.advance_cursor(index);
            }
        }
    }

    fn applied_index(&self) -> LogIndex {
        self.store.applied_index()
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let inner = self.store.inner.read().unwrap();
        serde_json::to_vec(&(inner.applied, &inner.state)).context("encode directory snapshot")
    }

    fn restore(&self, index: LogIndex, data: &[u8]) -> anyhow::Result<()> {
        let (applied, state): (LogIndex, DirectoryState) =
            serde_json::from_slice(data).context("decode directory snapshot")?;
        let mut inner = self.store.inner.write().unwrap();
        inner.applied = applied.max(index);
        inner.state = state;
        Ok(())
    }
}

/// Front end over the directory group for one node.
#[derive(Clone)]
pub struct Directory {
    handle: Handle,
    store: Arc<DirectoryStore>,
}

impl Directory {
    pub fn new(handle: Handle, store: Arc<DirectoryStore>) -> Self {
        Self { handle, store }
    }

    pub fn store(&self) -> &Arc<DirectoryStore> {
        &self.store
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub async fn is_leader(&self) -> bool {
        self.handle.status().await.role == tessera_raft::raft::Role::Leader
    }

    pub async fn leader_hint(&self) -> Option<NodeId> {
        self.handle.status().await.leader
    }

    /// Propose a command through the directory group. Succeeds only after
    /// majority-durable commit and local apply.
    pub async fn propose(&self, cmd: &DirectoryCommand) -> Result<LogIndex> {
        let payload = serde_json::to_vec(cmd)
            .context("encode directory command")
            .map_err(ClusterError::Internal)?;
        let index = self.handle.propose(payload, None).await?;
        Ok(index)
    }

    pub async fn register_node(&self, record: NodeRecord) -> Result<()> {
        self.propose(&DirectoryCommand::RegisterNode { record })
            .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, node_id: NodeId, ttl: Duration, load_slots: u64) -> Result<()> {
        self.propose(&DirectoryCommand::Heartbeat {
            node_id,
            now_ms: unix_time_ms(),
            ttl_ms: ttl.as_millis().min(u128::from(u64::MAX)) as u64,
            load_slots,
        })
        .await?;
        Ok(())
    }

    /// Fetch a shard map. Linearizable reads take the read-index barrier on
    /// the directory leader; bounded-stale reads serve from local applied
    /// state.
    pub async fn get_shard_map(
        &self,
        namespace: Namespace,
        object: &str,
        linearizable: bool,
    ) -> Result<ShardMap> {
        let key = MapKey::new(namespace, object);
        if linearizable {
            self.handle.read_index().await?;
        }
        self.store
            .shard_map(&key)
            .ok_or_else(|| ClusterError::UnknownObject {
                namespace: namespace.to_string(),
                object: object.to_string(),
            })
    }

    /// Lazy, restartable stream of map versions. Terminates only when the
    /// returned watch is dropped.
    pub fn watch_shard_map(&self, namespace: Namespace, object: &str) -> ShardMapWatch {
        self.store.watch(Some(MapKey::new(namespace, object)))
    }

    pub fn watch_all(&self) -> ShardMapWatch {
        self.store.watch(None)
    }

    /// Epoch-fenced placement transition for one partition. Fails with
    /// `EpochConflict` when the stored epoch moved; otherwise commits and
    /// bumps the epoch atomically.
    pub async fn propose_transition(
        &self,
        key: MapKey,
        partition: u32,
        expected_epoch: u64,
        replicas: Vec<NodeId>,
        non_voters: Vec<NodeId>,
        leader: Option<NodeId>,
    ) -> Result<ShardMap> {
        {
            // Fast-fail on an obviously stale expectation.
            let current = self
                .store
                .shard_map(&key)
                .and_then(|m| m.entry(partition).map(|e| e.epoch));
            if let Some(current) = current {
                if current != expected_epoch {
                    return Err(ClusterError::EpochConflict {
                        presented: expected_epoch,
                        current,
                    });
                }
            }
        }

        self.propose(&DirectoryCommand::Transition {
            key: key.clone(),
            partition,
            expected_epoch,
            replicas: replicas.clone(),
            non_voters: non_voters.clone(),
            leader,
        })
        .await?;

        let map = self
            .store
            .shard_map(&key)
            .ok_or_else(|| ClusterError::UnknownObject {
                namespace: key.namespace.to_string(),
                object: key.object.clone(),
            })?;
        let entry = map
            .entry(partition)
            .ok_or_else(|| ClusterError::Internal(anyhow::anyhow!("partition {partition} gone")))?;
        let applied = entry.epoch == expected_epoch + 1
            && entry.replicas == replicas
            && entry.non_voters == non_voters
            && entry.leader == leader;
        if applied {
            Ok(map)
        } else {
            Err(ClusterError::EpochConflict {
                presented: expected_epoch,
                current: entry.epoch,
            })
        }
    }

    pub async fn create_map(
        &self,
        key: MapKey,
        desc: NamespaceDesc,
        replica_sets: Vec<Vec<NodeId>>,
        leaders: Vec<Option<NodeId>>,
    ) -> Result<ShardMap> {
        self.propose(&DirectoryCommand::CreateMap {
            key: key.clone(),
            desc,
            replica_sets,
            leaders,
        })
        .await?;
        self.store
            .shard_map(&key)
            .ok_or_else(|| ClusterError::Internal(anyhow::anyhow!("map {key} missing after create")))
    }

    pub async fn set_frozen(&self, frozen: bool) -> Result<()> {
        self.propose(&DirectoryCommand::SetFrozen { frozen }).await?;
        Ok(())
    }

    pub async fn set_node_state(&self, node_id: NodeId, state: MemberState) -> Result<()> {
        self.propose(&DirectoryCommand::SetNodeState { node_id, state })
            .await?;
        Ok(())
    }

    pub fn state(&self) -> DirectoryState {
        self.store.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId) -> NodeRecord {
        NodeRecord {
            node_id: id,
            addr: format!("127.0.0.1:{}", 17000 + id),
            domain: FailureDomain {
                zone: format!("z{}", id % 3),
                rack: format!("r{id}"),
                host: format!("h{id}"),
            },
            capacity_slots: 100,
            load_slots: 0,
            version: "0.1.0".to_string(),
            state: MemberState::Active,
            lease_expires_unix_ms: 0,
        }
    }

    fn store_with_map() -> Arc<DirectoryStore> {
        let store = DirectoryStore::new();
        for (i, id) in (1..=3u64).enumerate() {
            store.apply_command(
                (i + 1) as u64,
                DirectoryCommand::RegisterNode { record: node(id) },
            );
        }
        store.apply_command(
            4,
            DirectoryCommand::CreateMap {
                key: MapKey::new(Namespace::Table, "users"),
                desc: NamespaceDesc::new(Namespace::Table, 2),
                replica_sets: vec![vec![1, 2, 3], vec![1, 2, 3]],
                leaders: vec![Some(1), Some(2)],
            },
        );
        store
    }

    #[test]
    fn transitions_are_epoch_fenced() {
        let store = store_with_map();
        let key = MapKey::new(Namespace::Table, "users");

        store.apply_command(
            5,
            DirectoryCommand::Transition {
                key: key.clone(),
                partition: 0,
                expected_epoch: 1,
                replicas: vec![1, 2, 3],
                non_voters: vec![],
                leader: Some(2),
            },
        );
        let map = store.shard_map(&key).unwrap();
        assert_eq!(map.entry(0).unwrap().epoch, 2);
        assert_eq!(map.entry(0).unwrap().leader, Some(2));

        // A command carrying the stale epoch is a no-op.
        store.apply_command(
            6,
            DirectoryCommand::Transition {
                key: key.clone(),
                partition: 0,
                expected_epoch: 1,
                replicas: vec![1, 2],
                non_voters: vec![],
                leader: Some(1),
            },
        );
        let map = store.shard_map(&key).unwrap();
        assert_eq!(map.entry(0).unwrap().epoch, 2);
        assert_eq!(map.entry(0).unwrap().replicas, vec![1, 2, 3]);
    }

    #[test]
    fn apply_is_idempotent_per_index() {
        let store = store_with_map();
        let key = MapKey::new(Namespace::Table, "users");
        let cmd = DirectoryCommand::Transition {
            key: key.clone(),
            partition: 1,
            expected_epoch: 1,
            replicas: vec![1, 2, 3],
            non_voters: vec![4],
            leader: Some(2),
        };
        store.apply_command(5, cmd.clone());
        store.apply_command(5, cmd);
        assert_eq!(store.shard_map(&key).unwrap().entry(1).unwrap().epoch, 2);
    }

    #[test]
    fn lease_expiry_marks_nodes_removed() {
        let store = store_with_map();
        store.apply_command(
            5,
            DirectoryCommand::Heartbeat {
                node_id: 3,
                now_ms: 1_000,
                ttl_ms: 500,
                load_slots: 7,
            },
        );
        store.apply_command(6, DirectoryCommand::ExpireLeases { now_ms: 2_000 });
        let state = store.state();
        // Node 3 is still referenced by the map, so the record stays but is
        // marked removed.
        assert_eq!(state.nodes.get(&3).unwrap().state, MemberState::Removed);
    }

    #[tokio::test]
    async fn watch_delivers_map_changes_in_epoch_order() {
        let store = store_with_map();
        let key = MapKey::new(Namespace::Table, "users");
        let mut watch = store.watch(Some(key.clone()));

        store.apply_command(
            5,
            DirectoryCommand::Transition {
                key: key.clone(),
                partition: 0,
                expected_epoch: 1,
                replicas: vec![1, 2, 3],
                non_voters: vec![],
                leader: Some(3),
            },
        );
        store.apply_command(6, DirectoryCommand::SetFrozen { frozen: true });

        match watch.recv().await {
            WatchItem::Event(DirectoryEvent::Map { map, .. }) => {
                assert_eq!(map.entry(0).unwrap().leader, Some(3));
            }
            other => panic!("unexpected watch item: {other:?}"),
        }
    }
}
