//! Placement planning.
//!
//! Pure, stateless functions computing initial partition assignments and
//! minimal rebalance plans. Candidates are scored by free capacity minus a
//! penalty for sharing a failure domain with an already-chosen replica;
//! ties break toward the lowest current load. Rate limiting lives in the
//! caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tessera_raft::raft::NodeId;

use crate::directory::{FailureDomain, MapKey, MemberState, NodeRecord, ShardMap};

/// Planner view of one candidate node.
#[derive(Clone, Debug)]
pub struct NodeInventory {
    pub node_id: NodeId,
    pub domain: FailureDomain,
    pub capacity_slots: u64,
    pub load_slots: u64,
    pub state: MemberState,
}

impl From<&NodeRecord> for NodeInventory {
    fn from(r: &NodeRecord) -> Self {
        Self {
            node_id: r.node_id,
            domain: r.domain.clone(),
            capacity_slots: r.capacity_slots,
            load_slots: r.load_slots,
            state: r.state,
        }
    }
}

/// One staged placement move.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanOp {
    /// Attach `node` as a catching-up non-voter.
    AddReplica {
        key: MapKey,
        partition: u32,
        node: NodeId,
    },
    /// Promote a caught-up non-voter to a voting replica.
    Promote {
        key: MapKey,
        partition: u32,
        node: NodeId,
    },
    /// Move leadership onto `node`.
    TransferLeader {
        key: MapKey,
        partition: u32,
        node: NodeId,
    },
    /// Remove a voting replica whose replacement has caught up.
    RemoveReplica {
        key: MapKey,
        partition: u32,
        node: NodeId,
    },
}

/// Planner tuning.
#[derive(Clone, Copy, Debug)]
pub struct PlacementPolicy {
    pub replication_factor: usize,
    /// A replica counts as caught up when its apply lag (entries behind the
    /// leader) is at or under this bound.
    pub catch_up_lag: u64,
    /// Cap on ops returned per planning run.
    pub max_moves: usize,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            catch_up_lag: 16,
            max_moves: 4,
        }
    }
}

/// Per-(partition, node) apply lag observed by the caller.
pub type LagView = BTreeMap<(u32, NodeId), u64>;

fn domain_penalty(candidate: &FailureDomain, chosen: &[&FailureDomain]) -> i64 {
    let mut penalty = 0i64;
    for other in chosen {
        if !candidate.zone.is_empty() && candidate.zone == other.zone {
            penalty += 1_000_000;
        }
        if !candidate.rack.is_empty() && candidate.rack == other.rack {
            penalty += 10_000;
        }
        if !candidate.host.is_empty() && candidate.host == other.host {
            penalty += 100_000;
        }
    }
    penalty
}

fn score(candidate: &NodeInventory, chosen: &[&FailureDomain]) -> i64 {
    let free = candidate.capacity_slots.saturating_sub(candidate.load_slots) as i64;
    free - domain_penalty(&candidate.domain, chosen)
}

fn pick_candidate<'a>(
    inventory: &'a [NodeInventory],
    exclude: &[NodeId],
    chosen_domains: &[&FailureDomain],
) -> Option<&'a NodeInventory> {
    inventory
        .iter()
        .filter(|n| n.state == MemberState::Active && !exclude.contains(&n.node_id))
        .max_by(|a, b| {
            score(a, chosen_domains)
                .cmp(&score(b, chosen_domains))
                // Ties break toward the lower current load, then stable ids.
                .then(b.load_slots.cmp(&a.load_slots))
                .then(b.node_id.cmp(&a.node_id))
        })
}

/// Initial replica assignment for `partitions` partitions.
///
/// First-fit-decreasing over score. Guarantees no two replicas of a
/// partition share a failure zone whenever the zone count is at least the
/// replication factor.
pub fn plan_initial(
    inventory: &[NodeInventory],
    partitions: u32,
    policy: &PlacementPolicy,
) -> anyhow::Result<Vec<Vec<NodeId>>> {
    let active: Vec<&NodeInventory> = inventory
        .iter()
        .filter(|n| n.state == MemberState::Active)
        .collect();
    let rf = policy.replication_factor.max(1);
    anyhow::ensure!(
        active.len() >= rf,
        "need {rf} active nodes, have {}",
        active.len()
    );

    // Track load the plan itself adds so partitions spread out.
    let mut planned_load: BTreeMap<NodeId, u64> = BTreeMap::new();
    let mut out = Vec::with_capacity(partitions as usize);
    for _ in 0..partitions {
        let mut replicas: Vec<NodeId> = Vec::with_capacity(rf);
        let mut chosen_domains: Vec<&FailureDomain> = Vec::with_capacity(rf);
        for _ in 0..rf {
            let adjusted: Vec<NodeInventory> = inventory
                .iter()
                .map(|n| {
                    let mut n = n.clone();
                    n.load_slots += planned_load.get(&n.node_id).copied().unwrap_or(0);
                    n
                })
                .collect();
            let Some(candidate) = pick_candidate(&adjusted, &replicas, &chosen_domains) else {
                anyhow::bail!("insufficient candidates for replication factor {rf}");
            };
            let node_id = candidate.node_id;
            replicas.push(node_id);
            *planned_load.entry(node_id).or_insert(0) += 1;
            if let Some(n) = inventory.iter().find(|n| n.node_id == node_id) {
                chosen_domains.push(&n.domain);
            }
        }
        out.push(replicas);
    }
    Ok(out)
}

/// Compute a minimal list of staged moves for one shard map.
///
/// Moves are staged per partition: add a replacement non-voter, wait for
/// catch-up, promote, move the lease off the outgoing replica, and only
/// then remove it. `RemoveReplica` is never emitted while no replacement is
/// within `catch_up_lag` of the leader.
pub fn plan_rebalance(
    map: &ShardMap,
    inventory: &[NodeInventory],
    lag: &LagView,
    policy: &PlacementPolicy,
) -> Vec<PlanOp> {
    let mut ops = Vec::new();
    let rf = policy.replication_factor.max(1);

    for entry in &map.entries {
        if ops.len() >= policy.max_moves {
            break;
        }
        let partition = entry.partition;
        let node_state = |id: NodeId| {
            inventory
                .iter()
                .find(|n| n.node_id == id)
                .map(|n| n.state)
                .unwrap_or(MemberState::Removed)
        };

        // 1. Promote any caught-up non-voter.
        if let Some(learner) = entry
            .non_voters
            .iter()
            .copied()
            .find(|id| lag.get(&(partition, *id)).copied().unwrap_or(u64::MAX) <= policy.catch_up_lag)
        {
            ops.push(PlanOp::Promote {
                key: map.key.clone(),
                partition,
                node: learner,
            });
            continue;
        }

        // 2. A donor is a voter on a non-active node.
        let donor = entry
            .replicas
            .iter()
            .copied()
            .find(|id| node_state(*id) != MemberState::Active);

        if let Some(donor) = donor {
            let healthy_voters = entry
                .replicas
                .iter()
                .filter(|id| node_state(**id) == MemberState::Active)
                .count();

            if healthy_voters >= rf {
                // Replacement already promoted. Move the lease first when the
                // donor still holds it, then remove — guarded by a caught-up
                // survivor.
                if entry.leader == Some(donor) {
                    if let Some(target) = entry
                        .replicas
                        .iter()
                        .copied()
                        .find(|id| *id != donor && node_state(*id) == MemberState::Active)
                    {
                        ops.push(PlanOp::TransferLeader {
                            key: map.key.clone(),
                            partition,
                            node: target,
                        });
                        continue;
                    }
                }
                // Removal is safe only when a full complement of active,
                // caught-up voters survives it — this is what makes the
                // replacement's lag, not just the old replicas', gate the
                // removal.
                let replacement_ready = entry
                    .replicas
                    .iter()
                    .filter(|id| {
                        **id != donor
                            && node_state(**id) == MemberState::Active
                            && lag.get(&(partition, **id)).copied().unwrap_or(u64::MAX)
                                <= policy.catch_up_lag
                    })
                    .count()
                    >= rf;
                if replacement_ready {
                    ops.push(PlanOp::RemoveReplica {
                        key: map.key.clone(),
                        partition,
                        node: donor,
                    });
                }
                continue;
            }

            // Need a replacement learner first.
            if entry.non_voters.is_empty() {
                let exclude: Vec<NodeId> = entry
                    .replicas
                    .iter()
                    .chain(entry.non_voters.iter())
                    .copied()
                    .collect();
                let chosen_domains: Vec<&FailureDomain> = entry
                    .replicas
                    .iter()
                    .filter(|id| **id != donor)
                    .filter_map(|id| inventory.iter().find(|n| n.node_id == *id))
                    .map(|n| &n.domain)
                    .collect();
                if let Some(candidate) = pick_candidate(inventory, &exclude, &chosen_domains) {
                    ops.push(PlanOp::AddReplica {
                        key: map.key.clone(),
                        partition,
                        node: candidate.node_id,
                    });
                }
            }
            continue;
        }

        // 3. Domain repair: two voters in one zone while enough zones exist.
        let zones: Vec<&str> = inventory
            .iter()
            .filter(|n| n.state == MemberState::Active && !n.domain.zone.is_empty())
            .map(|n| n.domain.zone.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        if zones.len() >= rf && entry.non_voters.is_empty() {
            let mut seen = std::collections::BTreeSet::new();
            let crowded = entry.replicas.iter().copied().find(|id| {
                let zone = inventory
                    .iter()
                    .find(|n| n.node_id == *id)
                    .map(|n| n.domain.zone.clone())
                    .unwrap_or_default();
                !zone.is_empty() && !seen.insert(zone)
            });
            if let Some(crowded) = crowded {
                let exclude: Vec<NodeId> = entry.replicas.clone();
                let chosen_domains: Vec<&FailureDomain> = entry
                    .replicas
                    .iter()
                    .filter(|id| **id != crowded)
                    .filter_map(|id| inventory.iter().find(|n| n.node_id == *id))
                    .map(|n| &n.domain)
                    .collect();
                if let Some(candidate) = pick_candidate(inventory, &exclude, &chosen_domains) {
                    if domain_penalty(&candidate.domain, &chosen_domains) == 0 {
                        ops.push(PlanOp::AddReplica {
                            key: map.key.clone(),
                            partition,
                            node: candidate.node_id,
                        });
                    }
                }
            }
            continue;
        }

        // 4. Shed an over-replicated partition once everything is healthy.
        if entry.replicas.len() > rf {
            let survivor_ready = |donor: NodeId| {
                entry
                    .replicas
                    .iter()
                    .filter(|id| {
                        **id != donor
                            && lag.get(&(partition, **id)).copied().unwrap_or(u64::MAX)
                                <= policy.catch_up_lag
                    })
                    .count()
                    >= rf
            };
            let extra = entry
                .replicas
                .iter()
                .copied()
                .filter(|id| Some(*id) != entry.leader)
                .max_by_key(|id| {
                    inventory
                        .iter()
                        .find(|n| n.node_id == *id)
                        .map(|n| n.load_slots)
                        .unwrap_or(u64::MAX)
                });
            if let Some(extra) = extra {
                if survivor_ready(extra) {
                    ops.push(PlanOp::RemoveReplica {
                        key: map.key.clone(),
                        partition,
                        node: extra,
                    });
                }
            }
        }
    }

    ops.truncate(policy.max_moves);
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::PartitionEntry;
    use crate::namespace::{Namespace, NamespaceDesc};

    fn inv(node_id: NodeId, zone: &str, capacity: u64, load: u64) -> NodeInventory {
        NodeInventory {
            node_id,
            domain: FailureDomain {
                zone: zone.to_string(),
                rack: format!("r{node_id}"),
                host: format!("h{node_id}"),
            },
            capacity_slots: capacity,
            load_slots: load,
            state: MemberState::Active,
        }
    }

    fn map_with_entry(entry: PartitionEntry) -> ShardMap {
        ShardMap {
            key: MapKey::new(Namespace::Table, "users"),
            desc: NamespaceDesc::new(Namespace::Table, 1),
            entries: vec![entry],
        }
    }

    #[test]
    fn initial_plan_spreads_across_zones() {
        let inventory = vec![
            inv(1, "z1", 100, 0),
            inv(2, "z1", 100, 0),
            inv(3, "z2", 100, 0),
            inv(4, "z3", 100, 0),
        ];
        let policy = PlacementPolicy::default();
        let plan = plan_initial(&inventory, 4, &policy).unwrap();
        for replicas in &plan {
            assert_eq!(replicas.len(), 3);
            let zones: std::collections::BTreeSet<&str> = replicas
                .iter()
                .map(|id| {
                    inventory
                        .iter()
                        .find(|n| n.node_id == *id)
                        .unwrap()
                        .domain
                        .zone
                        .as_str()
                })
                .collect();
            assert_eq!(zones.len(), 3, "replicas share a zone: {replicas:?}");
        }
    }

    #[test]
    fn dead_voter_gets_replacement_learner_first() {
        let inventory = vec![
            inv(1, "z1", 100, 0),
            inv(2, "z2", 100, 0),
            inv(4, "z3", 100, 0),
        ];
        // Node 3 is gone entirely (absent from inventory).
        let map = map_with_entry(PartitionEntry {
            partition: 0,
            group_id: 10,
            replicas: vec![1, 2, 3],
            non_voters: vec![],
            leader: Some(1),
            epoch: 5,
        });
        let ops = plan_rebalance(&map, &inventory, &LagView::new(), &PlacementPolicy::default());
        assert_eq!(
            ops,
            vec![PlanOp::AddReplica {
                key: map.key.clone(),
                partition: 0,
                node: 4
            }]
        );
    }

    #[test]
    fn remove_waits_for_replacement_catch_up() {
        let inventory = vec![
            inv(1, "z1", 100, 0),
            inv(2, "z2", 100, 0),
            inv(4, "z3", 100, 0),
        ];
        let map = map_with_entry(PartitionEntry {
            partition: 0,
            group_id: 10,
            // Replacement 4 already promoted; donor 3 still listed.
            replicas: vec![1, 2, 3, 4],
            non_voters: vec![],
            leader: Some(1),
            epoch: 6,
        });

        // Replacement far behind: no removal op may be emitted.
        let mut lag = LagView::new();
        lag.insert((0, 1), 0);
        lag.insert((0, 2), 0);
        lag.insert((0, 4), 500);
        let policy = PlacementPolicy {
            catch_up_lag: 16,
            ..PlacementPolicy::default()
        };
        let ops = plan_rebalance(&map, &inventory, &lag, &policy);
        assert!(
            !ops.iter()
                .any(|op| matches!(op, PlanOp::RemoveReplica { node: 3, .. })),
            "removed a replica before its replacement caught up: {ops:?}"
        );

        // Caught up: the donor may now be removed.
        lag.insert((0, 4), 3);
        let ops = plan_rebalance(&map, &inventory, &lag, &policy);
        assert!(ops
            .iter()
            .any(|op| matches!(op, PlanOp::RemoveReplica { node: 3, .. })));
    }

    #[test]
    fn caught_up_learner_promotes() {
        let inventory = vec![
            inv(1, "z1", 100, 0),
            inv(2, "z2", 100, 0),
            inv(4, "z3", 100, 0),
        ];
        let map = map_with_entry(PartitionEntry {
            partition: 0,
            group_id: 10,
            replicas: vec![1, 2, 3],
            non_voters: vec![4],
            leader: Some(1),
            epoch: 6,
        });
        let mut lag = LagView::new();
        lag.insert((0, 4), 2);
        let ops = plan_rebalance(&map, &inventory, &lag, &PlacementPolicy::default());
        assert_eq!(
            ops,
            vec![PlanOp::Promote {
                key: map.key.clone(),
                partition: 0,
                node: 4
            }]
        );
    }

    #[test]
    fn lease_moves_off_donor_before_removal() {
        let inventory = vec![
            inv(1, "z1", 100, 0),
            inv(2, "z2", 100, 0),
            inv(4, "z3", 100, 0),
        ];
        let map = map_with_entry(PartitionEntry {
            partition: 0,
            group_id: 10,
            replicas: vec![1, 2, 3, 4],
            non_voters: vec![],
            leader: Some(3),
            epoch: 7,
        });
        let mut lag = LagView::new();
        for id in [1u64, 2, 4] {
            lag.insert((0, id), 0);
        }
        let ops = plan_rebalance(&map, &inventory, &lag, &PlacementPolicy::default());
        assert!(matches!(ops[0], PlanOp::TransferLeader { node, .. } if node != 3));
    }
}
