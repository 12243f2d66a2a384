//! Stateless routing and scatter/gather execution.
//!
//! Writes resolve their partition, leader, and epoch from the shard map
//! cache, carry an idempotency token, and retry with one immediate
//! refresh-and-retry on staleness followed by bounded exponential backoff.
//! Reads fan out one subrequest per candidate partition after pruning and
//! merge partials under the namespace's merge contract. Hedged reads bound
//! tail latency when the policy allows a duplicate request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time;

use tessera_raft::raft::{GroupId, LogIndex};

use crate::auth::{Action, AuthGate};
use crate::directory::{MapKey, PartitionEntry};
use crate::error::{ClusterError, Result};
use crate::map_cache::ShardMapCache;
use crate::namespace::{MergeContract, Pruning};
use crate::partition::{DataCommand, Row, WriteOp};
use crate::transport::{DataClient, ReadKind, ReadPolicy, ReadRequest, ReadResponse, WriteAck};

#[derive(Clone, Copy, Debug)]
pub struct RouterConfig {
    /// Retries after the first attempt before surfacing failure.
    pub retry_budget: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Fire a duplicate read to a secondary replica after this long without
    /// a response. `None` disables hedging.
    pub hedge_threshold: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry_budget: 4,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(500),
            hedge_threshold: None,
        }
    }
}

/// Scan bounds for a query; `end` empty is unbounded.
#[derive(Clone, Debug, Default)]
pub struct ScanSpec {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    /// Per-partition row cap for one subrequest.
    pub per_partition_limit: usize,
}

/// One logical read built by the query layer.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub key: MapKey,
    pub pruning: Pruning,
    pub policy: ReadPolicy,
    pub scan: ScanSpec,
    /// Override for the namespace's default merge contract.
    pub order: Option<MergeContract>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Session state for timeline reads: the highest applied index observed per
/// group. Responses below the floor are regressions and are retried.
#[derive(Clone, Debug, Default)]
pub struct ReadSession {
    floors: HashMap<GroupId, LogIndex>,
}

impl ReadSession {
    pub fn floor(&self, group_id: GroupId) -> LogIndex {
        self.floors.get(&group_id).copied().unwrap_or(0)
    }

    pub fn observe(&mut self, group_id: GroupId, applied: LogIndex) {
        let floor = self.floors.entry(group_id).or_insert(0);
        *floor = (*floor).max(applied);
    }
}

pub struct Router {
    cache: Arc<ShardMapCache>,
    client: Arc<dyn DataClient>,
    auth: AuthGate,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        cache: Arc<ShardMapCache>,
        client: Arc<dyn DataClient>,
        auth: AuthGate,
        config: RouterConfig,
    ) -> Self {
        Self {
            cache,
            client,
            auth,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Route one write to its partition leader. The idempotency token makes
    /// the retry loop safe against duplicated application.
    pub async fn write(
        &self,
        actor: &str,
        key: &MapKey,
        routing_key: &[u8],
        ops: Vec<WriteOp>,
    ) -> Result<WriteAck> {
        self.auth.check(actor, Action::Write, &key.scope()).await?;
        let command = DataCommand::Write {
            ops,
            token: Some(rand::random::<u64>()),
        };
        let map = self.cache.get(key)?;
        let partition = map.desc.compute_partition(routing_key);
        self.write_partition(key, partition, command).await
    }

    /// Retry loop against one partition: refresh the map once on a
    /// staleness signal, then back off exponentially until the budget is
    /// spent.
    pub(crate) async fn write_partition(
        &self,
        key: &MapKey,
        partition: u32,
        command: DataCommand,
    ) -> Result<WriteAck> {
        let mut refreshed_once = false;
        let mut backoff = self.config.backoff_base;
        let mut last_err: Option<ClusterError> = None;

        for attempt in 0..=self.config.retry_budget {
            let map = self.cache.get(key)?;
            let entry = map.entry(partition).ok_or_else(|| {
                ClusterError::Internal(anyhow::anyhow!("partition {partition} missing from {key}"))
            })?;
            let target = entry
                .leader
                .or_else(|| entry.replicas.first().copied())
                .ok_or_else(|| ClusterError::QuorumUnavailable {
                    reason: format!("{key}#{partition} has no replicas"),
                })?;

            match self
                .client
                .write(target, entry.group_id, entry.epoch, command.clone())
                .await
            {
                Ok(ack) if ack.epoch < entry.epoch => {
                    // A response from before our cached configuration.
                    self.cache.invalidate(key);
                    last_err = Some(ClusterError::EpochConflict {
                        presented: entry.epoch,
                        current: ack.epoch,
                    });
                }
                Ok(ack) => return Ok(ack),
                Err(err) if err.refreshes_map() => {
                    self.cache.invalidate(key);
                    tracing::debug!(%key, partition, attempt, error = %err,
                        "write hit stale routing; refreshing map");
                    last_err = Some(err);
                    if !refreshed_once {
                        refreshed_once = true;
                        // One immediate retry on fresh routing state.
                        continue;
                    }
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(%key, partition, attempt, error = %err, "retryable write failure");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }

            if attempt < self.config.retry_budget {
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.backoff_max);
            }
        }
        Err(last_err.unwrap_or(ClusterError::Timeout))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Scatter one logical read across candidate partitions and merge the
    /// partials. `session` carries timeline monotonicity state; pass a
    /// fresh one for stateless callers.
    pub async fn query(
        &self,
        actor: &str,
        req: &QueryRequest,
        session: &mut ReadSession,
    ) -> Result<Vec<Row>> {
        self.auth
            .check(actor, Action::Read, &req.key.scope())
            .await?;
        let map = self.cache.get(&req.key)?;
        let candidates = map.desc.prune_candidates(&req.pruning);
        let contract = req.order.unwrap_or_else(|| map.desc.merge_contract());

        let mut futs = FuturesUnordered::new();
        for partition in candidates {
            let entry = map.entry(partition).ok_or_else(|| {
                ClusterError::Internal(anyhow::anyhow!(
                    "partition {partition} missing from {}",
                    req.key
                ))
            })?;
            let read = ReadRequest {
                policy: req.policy,
                kind: ReadKind::Scan {
                    start: req.scan.start.clone(),
                    end: req.scan.end.clone(),
                    limit: effective_partition_limit(req),
                },
                min_applied: session.floor(entry.group_id),
            };
            let group_id = entry.group_id;
            let map_key = map.key.clone();
            futs.push(async move {
                let resp = self.read_partition(&map_key, partition, read).await;
                (partition, group_id, resp)
            });
        }

        let mut partials: Vec<(u32, Vec<Row>)> = Vec::new();
        let mut observed: Vec<(GroupId, LogIndex)> = Vec::new();
        while let Some((partition, group_id, resp)) = futs.next().await {
            let resp = resp?;
            observed.push((group_id, resp.applied_index));
            partials.push((partition, resp.rows));
        }
        drop(futs);

        if req.policy == ReadPolicy::Timeline {
            for (group_id, applied) in observed {
                session.observe(group_id, applied);
            }
        }

        Ok(match contract {
            MergeContract::Unordered => merge_unordered(partials, req.offset, req.limit),
            MergeContract::OrderedByKey { descending } => merge_ordered(
                partials.into_iter().map(|(_, rows)| rows).collect(),
                descending,
                req.offset,
                req.limit,
            ),
        })
    }

    /// Point lookup under the requested policy.
    pub async fn get(
        &self,
        actor: &str,
        key: &MapKey,
        routing_key: &[u8],
        policy: ReadPolicy,
        session: &mut ReadSession,
    ) -> Result<Option<Row>> {
        self.auth.check(actor, Action::Read, &key.scope()).await?;
        let map = self.cache.get(key)?;
        let partition = map.desc.compute_partition(routing_key);
        let group_id = map
            .entry(partition)
            .map(|e| e.group_id)
            .ok_or_else(|| ClusterError::Internal(anyhow::anyhow!("partition {partition} missing")))?;
        let read = ReadRequest {
            policy,
            kind: ReadKind::Get {
                key: routing_key.to_vec(),
            },
            min_applied: session.floor(group_id),
        };
        let resp = self.read_partition(key, partition, read).await?;
        if policy == ReadPolicy::Timeline {
            session.observe(group_id, resp.applied_index);
        }
        Ok(resp.rows.into_iter().next())
    }

    fn read_targets(&self, entry: &PartitionEntry, policy: ReadPolicy) -> Vec<u64> {
        match policy {
            ReadPolicy::Strong => entry
                .leader
                .or_else(|| entry.replicas.first().copied())
                .into_iter()
                .collect(),
            ReadPolicy::Timeline | ReadPolicy::Eventual => {
                if entry.replicas.is_empty() {
                    return Vec::new();
                }
                // Rotate by partition so concurrent scans spread across
                // replicas instead of piling onto one.
                let start = entry.partition as usize % entry.replicas.len();
                let mut out = entry.replicas[start..].to_vec();
                out.extend_from_slice(&entry.replicas[..start]);
                out
            }
        }
    }

    /// Read one partition with the same refresh-once-then-back-off retry
    /// discipline as the write path. Each attempt re-resolves the map, so a
    /// failover observed mid-request reroutes instead of failing.
    async fn read_partition(
        &self,
        key: &MapKey,
        partition: u32,
        req: ReadRequest,
    ) -> Result<ReadResponse> {
        let mut backoff = self.config.backoff_base;
        let mut last_err: Option<ClusterError> = None;
        for attempt in 0..=self.config.retry_budget {
            let map = self.cache.get(key)?;
            let entry = map.entry(partition).ok_or_else(|| {
                ClusterError::Internal(anyhow::anyhow!("partition {partition} missing from {key}"))
            })?;
            match self.try_read_targets(entry, &req).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_retryable() => {
                    self.cache.invalidate(key);
                    tracing::debug!(%key, partition, attempt, error = %err, "read retry");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
            if attempt < self.config.retry_budget {
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.backoff_max);
            }
        }
        Err(last_err.unwrap_or(ClusterError::Timeout))
    }

    async fn try_read_targets(
        &self,
        entry: &PartitionEntry,
        req: &ReadRequest,
    ) -> Result<ReadResponse> {
        let targets = self.read_targets(entry, req.policy);
        if targets.is_empty() {
            return Err(ClusterError::QuorumUnavailable {
                reason: format!("partition {} has no readable replicas", entry.partition),
            });
        }
        let mut last_err: Option<ClusterError> = None;
        for (i, &target) in targets.iter().enumerate() {
            let hedge_to = targets.get(i + 1).copied();
            let result = match (self.config.hedge_threshold, hedge_to, req.policy) {
                (Some(threshold), Some(secondary), ReadPolicy::Timeline | ReadPolicy::Eventual) => {
                    self.hedged_read(target, secondary, entry.group_id, req.clone(), threshold)
                        .await
                }
                _ => self.client.read(target, entry.group_id, req.clone()).await,
            };
            match result {
                Ok(resp) if resp.epoch < entry.epoch => {
                    // Stale responder; discard and try another replica.
                    last_err = Some(ClusterError::EpochConflict {
                        presented: entry.epoch,
                        current: resp.epoch,
                    });
                }
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_retryable() => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(ClusterError::Timeout))
    }

    /// Duplicate the read to `secondary` once `threshold` elapses without a
    /// primary response; first answer wins, the other is discarded.
    async fn hedged_read(
        &self,
        primary: u64,
        secondary: u64,
        group_id: GroupId,
        req: ReadRequest,
        threshold: Duration,
    ) -> Result<ReadResponse> {
        let primary_fut = self.client.read(primary, group_id, req.clone());
        tokio::pin!(primary_fut);
        tokio::select! {
            res = &mut primary_fut => match res {
                Ok(resp) => Ok(resp),
                Err(_) => self.client.read(secondary, group_id, req).await,
            },
            _ = time::sleep(threshold) => {
                let secondary_fut = self.client.read(secondary, group_id, req);
                tokio::pin!(secondary_fut);
                tokio::select! {
                    res = &mut primary_fut => match res {
                        Ok(resp) => Ok(resp),
                        Err(_) => secondary_fut.await,
                    },
                    res = &mut secondary_fut => match res {
                        Ok(resp) => Ok(resp),
                        Err(_) => primary_fut.await,
                    },
                }
            }
        }
    }
}

fn effective_partition_limit(req: &QueryRequest) -> usize {
    let global = req
        .limit
        .map(|l| l.saturating_add(req.offset))
        .unwrap_or(usize::MAX);
    if req.scan.per_partition_limit == 0 {
        global
    } else {
        // Each partition must still return enough rows to satisfy the
        // global limit on its own, since the distribution is unknown.
        req.scan.per_partition_limit.max(global.min(1 << 20))
    }
}

/// Concatenate partials in partition order and apply global offset/limit.
/// Deterministic for identical inputs.
pub fn merge_unordered(
    mut partials: Vec<(u32, Vec<Row>)>,
    offset: usize,
    limit: Option<usize>,
) -> Vec<Row> {
    partials.sort_by_key(|(partition, _)| *partition);
    let iter = partials.into_iter().flat_map(|(_, rows)| rows).skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

/// Bounded k-way merge across key-sorted partials.
pub fn merge_ordered(
    batches: Vec<Vec<Row>>,
    descending: bool,
    offset: usize,
    limit: Option<usize>,
) -> Vec<Row> {
    let needed = match (descending, limit) {
        // Ascending with a limit can stop early; descending must merge
        // everything before reversing.
        (false, Some(limit)) => limit.saturating_add(offset),
        _ => usize::MAX,
    };

    let mut positions = vec![0usize; batches.len()];
    let mut merged: Vec<Row> = Vec::new();
    loop {
        if merged.len() >= needed {
            break;
        }
        let mut best: Option<usize> = None;
        for (i, batch) in batches.iter().enumerate() {
            let Some(row) = batch.get(positions[i]) else {
                continue;
            };
            best = match best {
                None => Some(i),
                Some(j) => {
                    let current = &batches[j][positions[j]];
                    if row.key < current.key {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        let Some(i) = best else { break };
        merged.push(batches[i][positions[i]].clone());
        positions[i] += 1;
    }

    if descending {
        merged.reverse();
    }
    let iter = merged.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}
