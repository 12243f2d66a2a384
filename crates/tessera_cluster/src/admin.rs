//! Operational surface.
//!
//! Discrete, idempotent commands for operators: add or drain a node,
//! inspect shard maps (members, leader, epoch, lag), trigger a rebalance
//! pass, freeze or unfreeze background reconfiguration, and create objects.
//! No streaming protocol; each call is a one-shot request.

use std::sync::Arc;

use serde::Serialize;

use tessera_raft::raft::{GroupId, NodeId};

use crate::directory::{Directory, MapKey, MemberState, NodeRecord};
use crate::error::{ClusterError, Result};
use crate::namespace::{Namespace, NamespaceDesc};
use crate::placement::{plan_initial, NodeInventory, PlacementPolicy};
use crate::rebalance;
use crate::transport::DataClient;

/// Per-partition inspection row.
#[derive(Clone, Debug, Serialize)]
pub struct PartitionReport {
    pub partition: u32,
    pub group_id: GroupId,
    pub replicas: Vec<NodeId>,
    pub non_voters: Vec<NodeId>,
    pub leader: Option<NodeId>,
    pub epoch: u64,
    /// Apply lag per member against the leader, where reachable.
    pub lag: Vec<(NodeId, u64)>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ShardMapReport {
    pub namespace: String,
    pub object: String,
    pub entries: Vec<PartitionReport>,
}

pub struct AdminApi {
    directory: Directory,
    client: Arc<dyn DataClient>,
    policy: PlacementPolicy,
}

impl AdminApi {
    pub fn new(directory: Directory, client: Arc<dyn DataClient>, policy: PlacementPolicy) -> Self {
        Self {
            directory,
            client,
            policy,
        }
    }

    /// Register (or re-register) a node. Idempotent: repeating the call
    /// refreshes the record.
    pub async fn add_node(&self, record: NodeRecord) -> Result<()> {
        self.directory.register_node(record).await
    }

    /// Begin draining a node. Repeating the call is a no-op; the rebalancer
    /// moves replicas off draining nodes over subsequent passes.
    pub async fn drain_node(&self, node_id: NodeId) -> Result<()> {
        self.directory
            .set_node_state(node_id, MemberState::Draining)
            .await
    }

    pub async fn freeze(&self, frozen: bool) -> Result<()> {
        self.directory.set_frozen(frozen).await
    }

    /// Create an object's shard map with an initial placement. Idempotent:
    /// an existing map is returned unchanged.
    pub async fn create_object(
        &self,
        namespace: Namespace,
        object: &str,
        partitions: u32,
    ) -> Result<()> {
        let key = MapKey::new(namespace, object);
        if self.directory.store().shard_map(&key).is_some() {
            return Ok(());
        }
        let state = self.directory.state();
        let inventory: Vec<NodeInventory> = state.nodes.values().map(Into::into).collect();
        let replica_sets = plan_initial(&inventory, partitions, &self.policy)
            .map_err(ClusterError::Internal)?;
        let leaders = replica_sets
            .iter()
            .enumerate()
            .map(|(partition, replicas)| {
                // Spread initial leadership round-robin over each set.
                replicas.get(partition % replicas.len().max(1)).copied()
            })
            .collect();
        self.directory
            .create_map(
                key,
                NamespaceDesc::new(namespace, partitions),
                replica_sets,
                leaders,
            )
            .await?;
        Ok(())
    }

    /// Inspect one shard map with live lag figures.
    pub async fn shard_map_report(
        &self,
        namespace: Namespace,
        object: &str,
    ) -> Result<ShardMapReport> {
        let map = self
            .directory
            .get_shard_map(namespace, object, false)
            .await?;
        let mut entries = Vec::with_capacity(map.entries.len());
        for entry in &map.entries {
            let mut lag = Vec::new();
            if let Some(leader) = entry.leader.or_else(|| entry.replicas.first().copied()) {
                if let Ok(leader_applied) =
                    self.client.applied_index(leader, entry.group_id).await
                {
                    for member in entry.replicas.iter().chain(entry.non_voters.iter()) {
                        if let Ok(applied) =
                            self.client.applied_index(*member, entry.group_id).await
                        {
                            lag.push((*member, leader_applied.saturating_sub(applied)));
                        }
                    }
                }
            }
            entries.push(PartitionReport {
                partition: entry.partition,
                group_id: entry.group_id,
                replicas: entry.replicas.clone(),
                non_voters: entry.non_voters.clone(),
                leader: entry.leader,
                epoch: entry.epoch,
                lag,
            });
        }
        Ok(ShardMapReport {
            namespace: namespace.to_string(),
            object: object.to_string(),
            entries,
        })
    }

    /// Run one rebalance pass now. Safe to repeat; each call applies at most
    /// one bounded batch of staged moves.
    pub async fn trigger_rebalance(&self, max_moves: usize) -> Result<usize> {
        rebalance::reconcile_once(
            &self.directory,
            self.client.as_ref(),
            &self.policy,
            max_moves.max(1),
        )
        .await
    }
}
