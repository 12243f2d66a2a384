//! Background replica rebalancing and decommission orchestration.
//!
//! Reconfiguration is staged per partition:
//! 1. attach the replacement as a non-voter (`AddReplica`)
//! 2. wait for catch-up, measured by apply-cursor lag against the leader
//! 3. promote to a voting replica (`Promote`)
//! 4. move the lease off the outgoing replica (`TransferLeader`)
//! 5. remove the outgoing replica (`RemoveReplica`)
//!
//! Only the directory leader drives moves, so there is exactly one
//! controller proposing transitions at a time. Every step is an epoch-fenced
//! directory transition plus a one-voter-at-a-time group reconfiguration.

use std::sync::Arc;
use std::time::Duration;

use tessera_raft::raft::Membership;

use crate::directory::{Directory, ShardMap};
use crate::error::Result;
use crate::placement::{plan_rebalance, LagView, NodeInventory, PlacementPolicy, PlanOp};
use crate::transport::DataClient;

/// Configuration for the background rebalancer.
#[derive(Clone, Copy, Debug)]
pub struct RebalanceConfig {
    /// Evaluate and apply at most one batch of moves at this interval.
    pub interval: Duration,
    /// Churn bound: moves executed per reconcile pass.
    pub moves_per_tick: usize,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            moves_per_tick: 2,
        }
    }
}

/// Spawn the background rebalancer loop.
pub fn spawn(
    directory: Directory,
    client: Arc<dyn DataClient>,
    policy: PlacementPolicy,
    config: RebalanceConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !directory.is_leader().await {
                continue;
            }
            match reconcile_once(&directory, client.as_ref(), &policy, config.moves_per_tick).await
            {
                Ok(moves) if moves > 0 => {
                    tracing::info!(moves, "rebalance pass applied moves");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "rebalance reconcile failed");
                }
            }
        }
    })
}

/// One reconcile pass: plan against current state and execute up to
/// `budget` staged moves. Also exposed to the admin surface for explicit
/// triggering.
pub async fn reconcile_once(
    directory: &Directory,
    client: &dyn DataClient,
    policy: &PlacementPolicy,
    budget: usize,
) -> Result<usize> {
    let state = directory.state();
    if state.frozen {
        return Ok(0);
    }
    let inventory: Vec<NodeInventory> = state.nodes.values().map(Into::into).collect();

    let mut executed = 0usize;
    for map in state.maps.values() {
        if executed >= budget {
            break;
        }
        let lag = collect_lag(client, map).await;
        let ops = plan_rebalance(map, &inventory, &lag, policy);
        for op in ops {
            if executed >= budget {
                break;
            }
            match execute_op(directory, client, map, &op).await {
                Ok(()) => executed += 1,
                Err(err) => {
                    // Stale epoch or unreachable peer; the next tick replans
                    // from fresh state.
                    tracing::debug!(error = %err, ?op, "rebalance step deferred");
                }
            }
        }
    }
    Ok(executed)
}

/// Apply-cursor lag per (partition, member), measured against the leader.
/// Unreachable members count as infinitely behind.
async fn collect_lag(client: &dyn DataClient, map: &ShardMap) -> LagView {
    let mut lag = LagView::new();
    for entry in &map.entries {
        let Some(leader) = entry.leader.or_else(|| entry.replicas.first().copied()) else {
            continue;
        };
        let leader_applied = match client.applied_index(leader, entry.group_id).await {
            Ok(applied) => applied,
            Err(_) => continue,
        };
        for member in entry.replicas.iter().chain(entry.non_voters.iter()) {
            let member_lag = match client.applied_index(*member, entry.group_id).await {
                Ok(applied) => leader_applied.saturating_sub(applied),
                Err(_) => u64::MAX,
            };
            lag.insert((entry.partition, *member), member_lag);
        }
    }
    lag
}

async fn execute_op(
    directory: &Directory,
    client: &dyn DataClient,
    map: &ShardMap,
    op: &PlanOp,
) -> Result<()> {
    match op {
        PlanOp::AddReplica {
            key,
            partition,
            node,
        } => {
            let entry = map.entry(*partition).cloned().ok_or_else(|| {
                crate::error::ClusterError::Internal(anyhow::anyhow!("entry {partition} missing"))
            })?;
            let mut non_voters = entry.non_voters.clone();
            if !non_voters.contains(node) {
                non_voters.push(*node);
            }
            let updated = directory
                .propose_transition(
                    key.clone(),
                    *partition,
                    entry.epoch,
                    entry.replicas.clone(),
                    non_voters,
                    entry.leader,
                )
                .await?;
            reconfigure_group(client, updated.entry(*partition).unwrap_or(&entry)).await
        }
        PlanOp::Promote {
            key,
            partition,
            node,
        } => {
            let entry = map.entry(*partition).cloned().ok_or_else(|| {
                crate::error::ClusterError::Internal(anyhow::anyhow!("entry {partition} missing"))
            })?;
            let mut replicas = entry.replicas.clone();
            if !replicas.contains(node) {
                replicas.push(*node);
            }
            let non_voters: Vec<_> = entry
                .non_voters
                .iter()
                .copied()
                .filter(|id| id != node)
                .collect();
            let updated = directory
                .propose_transition(
                    key.clone(),
                    *partition,
                    entry.epoch,
                    replicas,
                    non_voters,
                    entry.leader,
                )
                .await?;
            reconfigure_group(client, updated.entry(*partition).unwrap_or(&entry)).await
        }
        PlanOp::TransferLeader {
            key: _,
            partition,
            node,
        } => {
            let entry = map.entry(*partition).cloned().ok_or_else(|| {
                crate::error::ClusterError::Internal(anyhow::anyhow!("entry {partition} missing"))
            })?;
            let Some(current) = entry.leader else {
                return Ok(());
            };
            // The map's leader field catches up via the leadership reporter
            // once the transfer lands, bumping the epoch there.
            client
                .transfer_leader(current, entry.group_id, *node)
                .await
        }
        PlanOp::RemoveReplica {
            key,
            partition,
            node,
        } => {
            let entry = map.entry(*partition).cloned().ok_or_else(|| {
                crate::error::ClusterError::Internal(anyhow::anyhow!("entry {partition} missing"))
            })?;
            let replicas: Vec<_> = entry
                .replicas
                .iter()
                .copied()
                .filter(|id| id != node)
                .collect();
            let non_voters: Vec<_> = entry
                .non_voters
                .iter()
                .copied()
                .filter(|id| id != node)
                .collect();
            let leader = entry.leader.filter(|id| id != node);
            let updated = directory
                .propose_transition(key.clone(), *partition, entry.epoch, replicas, non_voters, leader)
                .await?;
            reconfigure_group(client, updated.entry(*partition).unwrap_or(&entry)).await
        }
    }
}

/// Push the directory's replica sets into the group's own membership.
async fn reconfigure_group(
    client: &dyn DataClient,
    entry: &crate::directory::PartitionEntry,
) -> Result<()> {
    let membership = Membership::new(entry.replicas.clone(), entry.non_voters.clone());
    let target = entry
        .leader
        .or_else(|| entry.replicas.first().copied())
        .ok_or_else(|| crate::error::ClusterError::QuorumUnavailable {
            reason: format!("partition {} has no reachable leader", entry.partition),
        })?;
    client
        .reconfigure(target, entry.group_id, membership)
        .await
}
