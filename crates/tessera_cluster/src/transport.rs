//! In-process transport mesh.
//!
//! The consensus engine and the data path are transport-agnostic trait
//! seams; this module provides the in-process implementation used by tests
//! and embedded clusters. A networked implementation slots in behind the
//! same traits. The mesh supports taking nodes down to exercise failover.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time;

use tessera_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, Group, GroupId, LogIndex, Membership, NodeId,
    SnapshotChunkRequest, SnapshotChunkResponse, Term, Transport, VoteRequest, VoteResponse,
};

use crate::directory::DirectoryCommand;
use crate::error::{ClusterError, Result};
use crate::partition::{Row, TxnId, Vote};

/// Read consistency policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadPolicy {
    /// Leader-only, linearizable via the read-index barrier.
    Strong,
    /// Any replica, bounded staleness with session monotonicity.
    Timeline,
    /// Any replica, no staleness bound.
    Eventual,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReadKind {
    Get { key: Vec<u8> },
    Scan {
        start: Vec<u8>,
        /// Empty means unbounded.
        end: Vec<u8>,
        limit: usize,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    pub policy: ReadPolicy,
    pub kind: ReadKind,
    /// Session floor for timeline reads: the replica must have applied at
    /// least this index or the response is rejected as regressed.
    pub min_applied: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub rows: Vec<Row>,
    pub applied_index: LogIndex,
    pub epoch: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WriteAck {
    pub commit_index: LogIndex,
    pub epoch: u64,
    /// Participant vote when the command was a transaction prepare.
    pub txn_vote: Option<Vote>,
}

/// Node-side request dispatch implemented by `node::Node`.
#[async_trait]
pub trait NodeHandler: Send + Sync + 'static {
    fn raft_group(&self, group_id: GroupId) -> Option<Arc<Group>>;
    async fn handle_write(
        &self,
        group_id: GroupId,
        epoch: u64,
        command: crate::partition::DataCommand,
    ) -> Result<WriteAck>;
    async fn handle_read(&self, group_id: GroupId, req: ReadRequest) -> Result<ReadResponse>;
    async fn handle_dir_propose(&self, cmd: DirectoryCommand) -> Result<LogIndex>;
    async fn handle_reconfigure(&self, group_id: GroupId, membership: Membership) -> Result<()>;
    async fn handle_transfer_leader(&self, group_id: GroupId, target: NodeId) -> Result<()>;
    async fn handle_applied_index(&self, group_id: GroupId) -> Result<LogIndex>;
    async fn handle_txn_vote(&self, group_id: GroupId, txn_id: TxnId) -> Result<Option<Vote>>;
}

/// Client surface used by routers and coordinators.
#[async_trait]
pub trait DataClient: Send + Sync + 'static {
    async fn write(
        &self,
        target: NodeId,
        group_id: GroupId,
        epoch: u64,
        command: crate::partition::DataCommand,
    ) -> Result<WriteAck>;
    async fn read(&self, target: NodeId, group_id: GroupId, req: ReadRequest)
        -> Result<ReadResponse>;
    async fn applied_index(&self, target: NodeId, group_id: GroupId) -> Result<LogIndex>;
    async fn reconfigure(
        &self,
        target: NodeId,
        group_id: GroupId,
        membership: Membership,
    ) -> Result<()>;
    async fn transfer_leader(&self, target: NodeId, group_id: GroupId, to: NodeId) -> Result<()>;
    async fn dir_propose(&self, target: NodeId, cmd: DirectoryCommand) -> Result<LogIndex>;
    async fn txn_vote(&self, target: NodeId, group_id: GroupId, txn_id: TxnId)
        -> Result<Option<Vote>>;
}

struct MeshInner {
    nodes: HashMap<NodeId, Weak<dyn NodeHandler>>,
    down: HashSet<NodeId>,
}

/// Direct-dispatch mesh connecting in-process nodes.
pub struct LocalMesh {
    inner: RwLock<MeshInner>,
    rpc_timeout: Duration,
}

impl LocalMesh {
    pub fn new(rpc_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(MeshInner {
                nodes: HashMap::new(),
                down: HashSet::new(),
            }),
            rpc_timeout,
        })
    }

    pub fn register(&self, node_id: NodeId, handler: Weak<dyn NodeHandler>) {
        self.inner.write().unwrap().nodes.insert(node_id, handler);
    }

    /// Take a node off the mesh (crash simulation) or bring it back.
    pub fn set_down(&self, node_id: NodeId, down: bool) {
        let mut inner = self.inner.write().unwrap();
        if down {
            inner.down.insert(node_id);
        } else {
            inner.down.remove(&node_id);
        }
    }

    pub fn is_down(&self, node_id: NodeId) -> bool {
        self.inner.read().unwrap().down.contains(&node_id)
    }

    fn handler(&self, node_id: NodeId) -> Result<Arc<dyn NodeHandler>> {
        let inner = self.inner.read().unwrap();
        if inner.down.contains(&node_id) {
            return Err(ClusterError::QuorumUnavailable {
                reason: format!("node {node_id} unreachable"),
            });
        }
        inner
            .nodes
            .get(&node_id)
            .and_then(|w| w.upgrade())
            .ok_or_else(|| ClusterError::QuorumUnavailable {
                reason: format!("node {node_id} not registered"),
            })
    }

    fn raft_handler(&self, node_id: NodeId, group_id: GroupId) -> anyhow::Result<Arc<Group>> {
        let handler = self
            .handler(node_id)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        handler
            .raft_group(group_id)
            .ok_or_else(|| anyhow::anyhow!("node {node_id} has no group {group_id}"))
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match time::timeout(self.rpc_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout),
        }
    }
}

#[async_trait]
impl Transport for LocalMesh {
    async fn request_vote(&self, target: NodeId, req: VoteRequest) -> anyhow::Result<VoteResponse> {
        let group = self.raft_handler(target, req.group_id)?;
        group.handle_request_vote(req).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let group = self.raft_handler(target, req.group_id)?;
        group.handle_append_entries(req).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        req: SnapshotChunkRequest,
    ) -> anyhow::Result<SnapshotChunkResponse> {
        let group = self.raft_handler(target, req.group_id)?;
        group.handle_install_snapshot(req).await
    }

    async fn timeout_now(
        &self,
        target: NodeId,
        group_id: GroupId,
        term: Term,
    ) -> anyhow::Result<()> {
        let group = self.raft_handler(target, group_id)?;
        group.handle_timeout_now(term).await
    }
}

#[async_trait]
impl DataClient for LocalMesh {
    async fn write(
        &self,
        target: NodeId,
        group_id: GroupId,
        epoch: u64,
        command: crate::partition::DataCommand,
    ) -> Result<WriteAck> {
        let handler = self.handler(target)?;
        self.with_timeout(handler.handle_write(group_id, epoch, command))
            .await
    }

    async fn read(
        &self,
        target: NodeId,
        group_id: GroupId,
        req: ReadRequest,
    ) -> Result<ReadResponse> {
        let handler = self.handler(target)?;
        self.with_timeout(handler.handle_read(group_id, req)).await
    }

    async fn applied_index(&self, target: NodeId, group_id: GroupId) -> Result<LogIndex> {
        let handler = self.handler(target)?;
        self.with_timeout(handler.handle_applied_index(group_id))
            .await
    }

    async fn reconfigure(
        &self,
        target: NodeId,
        group_id: GroupId,
        membership: Membership,
    ) -> Result<()> {
        let handler = self.handler(target)?;
        self.with_timeout(handler.handle_reconfigure(group_id, membership))
            .await
    }

    async fn transfer_leader(&self, target: NodeId, group_id: GroupId, to: NodeId) -> Result<()> {
        let handler = self.handler(target)?;
        self.with_timeout(handler.handle_transfer_leader(group_id, to))
            .await
    }

    async fn dir_propose(&self, target: NodeId, cmd: DirectoryCommand) -> Result<LogIndex> {
        let handler = self.handler(target)?;
        self.with_timeout(handler.handle_dir_propose(cmd)).await
    }

    async fn txn_vote(
        &self,
        target: NodeId,
        group_id: GroupId,
        txn_id: TxnId,
    ) -> Result<Option<Vote>> {
        let handler = self.handler(target)?;
        self.with_timeout(handler.handle_txn_vote(group_id, txn_id))
            .await
    }
}
