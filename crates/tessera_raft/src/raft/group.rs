//! Replication engine for a single consensus group.
//!
//! This file contains the election and heartbeat loop, the proposal path
//! with epoch fencing, quorum commit advancement, the apply loop, the
//! read-index barrier, chunked snapshot transfer, and staged membership
//! changes. One `Group` runs per partition; groups are fully independent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time;

use super::state::{ApplyWaiter, PendingSnapshot, RaftState};
use super::types::{
    AppendEntriesRequest, AppendEntriesResponse, Config, EntryKind, GroupId, LogEntry, LogIndex,
    LogStore, Membership, NodeId, RaftError, Role, SnapshotChunkRequest, SnapshotChunkResponse,
    StateMachine, Term, Transport, VoteRequest, VoteResponse, SNAPSHOT_CHUNK_BYTES,
};

/// Lightweight handle used by callers to submit proposals and reads.
#[derive(Clone)]
pub struct Handle {
    group: Arc<Group>,
}

impl Handle {
    pub fn new(group: Arc<Group>) -> Self {
        Self { group }
    }

    pub async fn propose(
        &self,
        command: Vec<u8>,
        expected_epoch: Option<u64>,
    ) -> Result<LogIndex, RaftError> {
        self.group.propose(command, expected_epoch).await
    }

    pub async fn read_index(&self) -> Result<LogIndex, RaftError> {
        self.group.read_index().await
    }

    pub async fn status(&self) -> GroupStatus {
        self.group.status().await
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }
}

/// Point-in-time view of group internals for routing, admin, and lag checks.
#[derive(Clone, Debug)]
pub struct GroupStatus {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub routing_epoch: u64,
    pub membership: Membership,
    /// Leader-side replication lag per peer (last index minus match index).
    pub peer_lag: Vec<(NodeId, u64)>,
}

/// The consensus group: owns transport, log, state machine and state.
///
/// Design notes:
/// - All mutable consensus state sits behind one async mutex with short
///   critical sections; RPC waits never hold it.
/// - The apply loop is the only writer of `last_applied`, so state-machine
///   application stays sequential per partition.
pub struct Group {
    config: Config,
    transport: Arc<dyn Transport>,
    sm: Arc<dyn StateMachine>,
    log: Arc<dyn LogStore>,
    state: Mutex<RaftState>,
    apply_notify: Notify,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Group {
    /// Build a group from durable state. Membership changes recorded in the
    /// retained log are re-installed so a restart converges on the same
    /// configuration it crashed with.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        sm: Arc<dyn StateMachine>,
        log: Arc<dyn LogStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let hs = log.load_hard_state()?.unwrap_or_default();
        let applied = sm.applied_index();
        let mut membership = config.membership.clone();

        let first = log.first_index();
        for index in first..=applied.max(first.saturating_sub(1)) {
            if let Some(entry) = log.entry(index)? {
                if entry.kind == EntryKind::ConfigChange {
                    membership = decode_membership(&entry.command)?;
                }
            }
        }

        let band = (config.election_timeout_min, config.election_timeout_max);
        let mut state = RaftState::new(hs, membership, applied, band);
        if !state.membership.is_voter(config.node_id) {
            state.role = Role::NonVoter;
        }
        Ok(Arc::new(Self {
            config,
            transport,
            sm,
            log,
            state: Mutex::new(state),
            apply_notify: Notify::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Spawn the tick and apply tasks. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let tick = self
            .config
            .heartbeat_interval
            .min(Duration::from_millis(25))
            .max(Duration::from_millis(5));

        let group = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(tick);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if group.stopped.load(Ordering::SeqCst) {
                    return;
                }
                group.tick().await;
            }
        });

        let group = Arc::clone(self);
        tokio::spawn(async move { group.run_apply().await });
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.apply_notify.notify_waiters();
    }

    pub fn group_id(&self) -> GroupId {
        self.config.group_id
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    fn band(&self) -> (Duration, Duration) {
        (
            self.config.election_timeout_min,
            self.config.election_timeout_max,
        )
    }

    fn term_at(&self, index: LogIndex) -> anyhow::Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if let Some(term) = self.log.term_of(index)? {
            return Ok(Some(term));
        }
        let (cidx, cterm) = self.log.compacted();
        Ok((index == cidx).then_some(cterm))
    }

    /// Install a new routing epoch from the control plane. Monotone.
    pub async fn install_epoch(&self, epoch: u64) {
        let mut st = self.state.lock().await;
        st.routing_epoch = st.routing_epoch.max(epoch);
    }

    pub async fn status(&self) -> GroupStatus {
        let st = self.state.lock().await;
        let last = self.log.last_index();
        let peer_lag = if st.role == Role::Leader {
            st.progress
                .iter()
                .map(|(id, p)| (*id, last.saturating_sub(p.match_index)))
                .collect()
        } else {
            Vec::new()
        };
        GroupStatus {
            group_id: self.config.group_id,
            node_id: self.config.node_id,
            role: st.role,
            term: st.term,
            leader: st.leader_hint,
            commit_index: st.commit_index,
            applied_index: st.last_applied,
            routing_epoch: st.routing_epoch,
            membership: st.membership.clone(),
            peer_lag,
        }
    }

    // ------------------------------------------------------------------
    // Tick: elections and heartbeats
    // ------------------------------------------------------------------

    async fn tick(self: &Arc<Self>) {
        enum Action {
            None,
            Campaign,
            Heartbeat,
        }

        let action = {
            let mut st = self.state.lock().await;
            if st.corrupt_at.is_some() {
                Action::None
            } else {
                match st.role {
                    Role::Leader => {
                        if st.last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                            st.last_heartbeat = time::Instant::now();
                            Action::Heartbeat
                        } else {
                            Action::None
                        }
                    }
                    // Learners wait for the control plane; they never campaign.
                    Role::NonVoter => Action::None,
                    Role::Follower | Role::Candidate => {
                        if time::Instant::now() >= st.election_deadline {
                            Action::Campaign
                        } else {
                            Action::None
                        }
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::Heartbeat => self.broadcast_append(),
            Action::Campaign => self.start_election().await,
        }
    }

    async fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term, peers, quorum) = {
            let mut st = self.state.lock().await;
            if !st.membership.is_voter(self.config.node_id) {
                st.role = Role::NonVoter;
                return;
            }
            st.term += 1;
            st.role = Role::Candidate;
            st.voted_for = Some(self.config.node_id);
            st.leader_hint = None;
            st.reset_election_deadline(self.band());
            if let Err(err) = self.log.save_hard_state(&st.hard_state()) {
                tracing::warn!(group = self.config.group_id, error = ?err, "failed to persist vote");
                return;
            }
            let last = self.log.last_index();
            let last_term = match self.term_at(last) {
                Ok(t) => t.unwrap_or(0),
                Err(_) => 0,
            };
            let peers: Vec<NodeId> = st
                .membership
                .voters
                .iter()
                .copied()
                .filter(|id| *id != self.config.node_id)
                .collect();
            (st.term, last, last_term, peers, st.membership.quorum())
        };

        tracing::debug!(
            group = self.config.group_id,
            node = self.config.node_id,
            term,
            "starting election"
        );

        if peers.is_empty() {
            self.finish_election(term, quorum, 1).await;
            return;
        }

        let mut futs = FuturesUnordered::new();
        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let req = VoteRequest {
                group_id: self.config.group_id,
                term,
                candidate: self.config.node_id,
                last_log_index,
                last_log_term,
            };
            let timeout = self.config.rpc_timeout;
            futs.push(async move {
                time::timeout(timeout, transport.request_vote(peer, req))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
            });
        }

        let mut granted = 1usize; // own vote
        while let Some(res) = futs.next().await {
            let Some(resp) = res else { continue };
            if resp.term > term {
                let mut st = self.state.lock().await;
                if resp.term > st.term {
                    st.step_down(self.config.node_id, resp.term, self.band());
                    let _ = self.log.save_hard_state(&st.hard_state());
                }
                return;
            }
            if resp.granted {
                granted += 1;
                if granted >= quorum {
                    break;
                }
            }
        }
        self.finish_election(term, quorum, granted).await;
    }

    async fn finish_election(self: &Arc<Self>, term: Term, quorum: usize, granted: usize) {
        if granted < quorum {
            return;
        }
        {
            let mut st = self.state.lock().await;
            if st.role != Role::Candidate || st.term != term {
                return;
            }
            st.become_leader(self.config.node_id, self.log.last_index());
            // Commit barrier for earlier terms: entries from previous terms
            // only commit transitively through an entry of this term.
            let noop = LogEntry {
                term: st.term,
                index: self.log.last_index() + 1,
                kind: EntryKind::Noop,
                command: Vec::new(),
            };
            if let Err(err) = self.log.append(&[noop], true) {
                tracing::warn!(group = self.config.group_id, error = ?err, "noop append failed");
            } else if let Err(err) = self.advance_commit_locked(&mut st) {
                tracing::warn!(group = self.config.group_id, error = ?err, "commit advance failed");
            }
            tracing::info!(
                group = self.config.group_id,
                node = self.config.node_id,
                term,
                "became leader"
            );
        }
        self.broadcast_append();
    }

    // ------------------------------------------------------------------
    // Vote and append handlers (server side)
    // ------------------------------------------------------------------

    pub async fn handle_request_vote(&self, req: VoteRequest) -> anyhow::Result<VoteResponse> {
        let mut st = self.state.lock().await;
        if req.term > st.term {
            st.step_down(self.config.node_id, req.term, self.band());
            self.log
                .save_hard_state(&st.hard_state())
                .context("persist term bump")?;
        }

        let mut granted = false;
        if req.term == st.term
            && st.membership.is_voter(self.config.node_id)
            && (st.voted_for.is_none() || st.voted_for == Some(req.candidate))
        {
            let last = self.log.last_index();
            let last_term = self.term_at(last)?.unwrap_or(0);
            let up_to_date = (req.last_log_term, req.last_log_index) >= (last_term, last);
            if up_to_date {
                granted = true;
                st.voted_for = Some(req.candidate);
                self.log
                    .save_hard_state(&st.hard_state())
                    .context("persist vote")?;
                st.reset_election_deadline(self.band());
            }
        }
        Ok(VoteResponse {
            term: st.term,
            granted,
        })
    }

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let mut st = self.state.lock().await;
        if req.term < st.term {
            return Ok(AppendEntriesResponse {
                term: st.term,
                success: false,
                match_index: 0,
                conflict_index: 0,
            });
        }

        if req.term > st.term {
            st.term = req.term;
            st.voted_for = None;
            self.log
                .save_hard_state(&st.hard_state())
                .context("persist term bump")?;
        }
        if st.role == Role::Leader || st.role == Role::Candidate {
            st.fail_waiters(|| RaftError::LeadershipLost);
        }
        st.role = if st.membership.is_voter(self.config.node_id) {
            Role::Follower
        } else {
            Role::NonVoter
        };
        st.leader_hint = Some(req.leader);
        st.routing_epoch = st.routing_epoch.max(req.epoch);
        st.reset_election_deadline(self.band());

        // Log-matching check at prev. Indexes at or below the compaction
        // point are covered by a durable snapshot and always match.
        let (cidx, _) = self.log.compacted();
        let last = self.log.last_index();
        if req.prev_log_index > last {
            return Ok(AppendEntriesResponse {
                term: st.term,
                success: false,
                match_index: 0,
                conflict_index: last + 1,
            });
        }
        if req.prev_log_index > cidx {
            match self.term_at(req.prev_log_index)? {
                Some(term) if term == req.prev_log_term => {}
                _ => {
                    self.log.truncate_from(req.prev_log_index)?;
                    return Ok(AppendEntriesResponse {
                        term: st.term,
                        success: false,
                        match_index: 0,
                        conflict_index: req.prev_log_index,
                    });
                }
            }
        }

        let mut to_append = Vec::new();
        for entry in &req.entries {
            if entry.index <= cidx {
                continue;
            }
            match self.log.term_of(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    // Conflicting suffix from a deposed leader; drop it.
                    self.log.truncate_from(entry.index)?;
                    to_append.push(entry.clone());
                }
                None => to_append.push(entry.clone()),
            }
        }
        if !to_append.is_empty() {
            self.log
                .append(&to_append, self.config.sync_policy.follower_sync())
                .context("append replicated entries")?;
        }

        let match_index = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > st.commit_index {
            st.commit_index = req.leader_commit.min(self.log.last_index());
            self.apply_notify.notify_one();
        }

        Ok(AppendEntriesResponse {
            term: st.term,
            success: true,
            match_index,
            conflict_index: 0,
        })
    }

    // ------------------------------------------------------------------
    // Leader replication
    // ------------------------------------------------------------------

    /// Fire one replication round at every peer. Cheap to call; peers with a
    /// round already in flight are skipped.
    fn broadcast_append(self: &Arc<Self>) {
        let group = Arc::clone(self);
        tokio::spawn(async move {
            let peers = {
                let st = group.state.lock().await;
                if st.role != Role::Leader {
                    return;
                }
                st.progress.keys().copied().collect::<Vec<_>>()
            };
            for peer in peers {
                tokio::spawn(Arc::clone(&group).replicate_to(peer));
            }
        });
    }

    fn spawn_replicate(self: Arc<Self>, peer: NodeId) {
        tokio::spawn(self.replicate_to(peer));
    }

    async fn replicate_to(self: Arc<Self>, peer: NodeId) {
        enum Round {
            Append(AppendEntriesRequest),
            Snapshot,
        }

        let round = {
            let mut st = self.state.lock().await;
            if st.role != Role::Leader {
                return;
            }
            let Some(prog) = st.progress.get_mut(&peer) else {
                return;
            };
            if prog.inflight {
                return;
            }
            prog.inflight = true;
            let next = prog.next_index;
            let (cidx, _) = self.log.compacted();
            if next <= cidx {
                Round::Snapshot
            } else {
                let prev = next - 1;
                let prev_term = match self.term_at(prev) {
                    Ok(Some(t)) => t,
                    _ => {
                        prog.inflight = false;
                        return;
                    }
                };
                let entries = match self.log.entries(
                    next,
                    self.log.last_index(),
                    self.config.max_append_bytes,
                ) {
                    Ok(entries) => entries,
                    Err(err) => {
                        tracing::warn!(group = self.config.group_id, peer, error = ?err, "log read failed");
                        prog.inflight = false;
                        return;
                    }
                };
                Round::Append(AppendEntriesRequest {
                    group_id: self.config.group_id,
                    term: st.term,
                    leader: self.config.node_id,
                    prev_log_index: prev,
                    prev_log_term: prev_term,
                    entries,
                    leader_commit: st.commit_index,
                    epoch: st.routing_epoch,
                })
            }
        };

        match round {
            Round::Snapshot => {
                if let Err(err) = self.send_snapshot_to(peer).await {
                    tracing::warn!(group = self.config.group_id, peer, error = ?err, "snapshot transfer failed");
                }
                let mut st = self.state.lock().await;
                if let Some(prog) = st.progress.get_mut(&peer) {
                    prog.inflight = false;
                }
            }
            Round::Append(req) => {
                let term = req.term;
                let sent = req.prev_log_index + req.entries.len() as u64;
                let result =
                    time::timeout(self.config.rpc_timeout, self.transport.append_entries(peer, req))
                        .await;
                let mut st = self.state.lock().await;
                if let Some(prog) = st.progress.get_mut(&peer) {
                    prog.inflight = false;
                }
                let Ok(Ok(resp)) = result else { return };
                if resp.term > st.term {
                    st.step_down(self.config.node_id, resp.term, self.band());
                    st.fail_waiters(|| RaftError::LeadershipLost);
                    let _ = self.log.save_hard_state(&st.hard_state());
                    return;
                }
                if st.role != Role::Leader || st.term != term {
                    return;
                }
                let more = {
                    let Some(prog) = st.progress.get_mut(&peer) else {
                        return;
                    };
                    if resp.success {
                        prog.match_index = prog.match_index.max(resp.match_index.min(sent));
                        prog.next_index = prog.match_index + 1;
                    } else {
                        prog.next_index = resp.conflict_index.max(1).min(self.log.last_index() + 1);
                    }
                    prog.next_index <= self.log.last_index()
                };
                if resp.success {
                    if let Err(err) = self.advance_commit_locked(&mut st) {
                        tracing::warn!(group = self.config.group_id, error = ?err, "commit advance failed");
                    }
                }
                drop(st);
                if more {
                    Arc::clone(&self).spawn_replicate(peer);
                }
            }
        }
    }

    fn advance_commit_locked(&self, st: &mut RaftState) -> anyhow::Result<()> {
        let quorum = st.quorum_index(self.config.node_id, self.log.last_index());
        if quorum > st.commit_index {
            // Only entries from the current term commit by counting; older
            // entries commit transitively.
            if self.term_at(quorum)? == Some(st.term) {
                st.commit_index = quorum;
                self.apply_notify.notify_one();
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    /// Append a command on the leader and wait until it is committed and
    /// applied, returning the commit index acknowledged to the client.
    ///
    /// `expected_epoch` is the routing epoch the caller resolved from its
    /// shard map; a mismatch fences the write so a router with a stale map
    /// refreshes before retrying.
    pub async fn propose(
        self: &Arc<Self>,
        command: Vec<u8>,
        expected_epoch: Option<u64>,
    ) -> Result<LogIndex, RaftError> {
        self.propose_entry(EntryKind::Normal, command, expected_epoch)
            .await
    }

    async fn propose_entry(
        self: &Arc<Self>,
        kind: EntryKind,
        command: Vec<u8>,
        expected_epoch: Option<u64>,
    ) -> Result<LogIndex, RaftError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        let (index, rx) = {
            let mut st = self.state.lock().await;
            if let Some(at) = st.corrupt_at {
                return Err(RaftError::LogCorrupt {
                    group: self.config.group_id,
                    index: at,
                });
            }
            if st.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    group: self.config.group_id,
                    leader: st.leader_hint,
                    current_epoch: st.routing_epoch,
                });
            }
            if let Some(presented) = expected_epoch {
                if presented != st.routing_epoch {
                    return Err(RaftError::EpochConflict {
                        presented,
                        current: st.routing_epoch,
                    });
                }
            }
            let index = self.log.last_index() + 1;
            let entry = LogEntry {
                term: st.term,
                index,
                kind,
                command,
            };
            // The leader always fsyncs its own append; SyncPolicy only
            // relaxes follower persistence.
            self.log
                .append(&[entry], true)
                .map_err(RaftError::Internal)?;
            let (tx, rx) = oneshot::channel();
            st.apply_waiters.push(ApplyWaiter { index, tx });
            self.advance_commit_locked(&mut st)
                .map_err(RaftError::Internal)?;
            (index, rx)
        };

        self.broadcast_append();

        match time::timeout(self.config.propose_timeout, rx).await {
            Err(_) => {
                let mut st = self.state.lock().await;
                st.apply_waiters.retain(|w| !w.tx.is_closed());
                Err(RaftError::Timeout)
            }
            Ok(Err(_)) => Err(RaftError::LeadershipLost),
            Ok(Ok(result)) => result.map(|_| index),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Linearizable read barrier: capture the commit index, confirm
    /// leadership with a heartbeat round, then wait for apply to catch up.
    pub async fn read_index(self: &Arc<Self>) -> Result<LogIndex, RaftError> {
        let commit = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    group: self.config.group_id,
                    leader: st.leader_hint,
                    current_epoch: st.routing_epoch,
                });
            }
            st.commit_index
        };
        self.confirm_leadership().await?;
        self.wait_applied(commit, self.config.propose_timeout)
            .await?;
        Ok(commit)
    }

    async fn confirm_leadership(self: &Arc<Self>) -> Result<(), RaftError> {
        let (term, commit, epoch, peers, quorum, self_votes) = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    group: self.config.group_id,
                    leader: st.leader_hint,
                    current_epoch: st.routing_epoch,
                });
            }
            let peers: Vec<(NodeId, LogIndex)> = st
                .membership
                .voters
                .iter()
                .copied()
                .filter(|id| *id != self.config.node_id)
                .map(|id| {
                    let next = st.progress.get(&id).map(|p| p.next_index).unwrap_or(1);
                    (id, next.saturating_sub(1))
                })
                .collect();
            let self_votes = usize::from(st.membership.is_voter(self.config.node_id));
            (
                st.term,
                st.commit_index,
                st.routing_epoch,
                peers,
                st.membership.quorum(),
                self_votes,
            )
        };

        if peers.is_empty() && self_votes >= quorum {
            return Ok(());
        }

        let mut futs = FuturesUnordered::new();
        for (peer, prev) in peers {
            let prev_term = self.term_at(prev).ok().flatten().unwrap_or(0);
            let req = AppendEntriesRequest {
                group_id: self.config.group_id,
                term,
                leader: self.config.node_id,
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries: Vec::new(),
                leader_commit: commit,
                epoch,
            };
            let transport = Arc::clone(&self.transport);
            let timeout = self.config.rpc_timeout;
            futs.push(async move {
                time::timeout(timeout, transport.append_entries(peer, req))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
            });
        }

        let mut acks = self_votes;
        while let Some(res) = futs.next().await {
            let Some(resp) = res else { continue };
            if resp.term > term {
                let mut st = self.state.lock().await;
                if resp.term > st.term {
                    st.step_down(self.config.node_id, resp.term, self.band());
                    st.fail_waiters(|| RaftError::LeadershipLost);
                    let _ = self.log.save_hard_state(&st.hard_state());
                }
                return Err(RaftError::NotLeader {
                    group: self.config.group_id,
                    leader: None,
                    current_epoch: 0,
                });
            }
            // Any same-term response acknowledges this leader for the round,
            // even if the peer still needs log backup.
            acks += 1;
            if acks >= quorum {
                return Ok(());
            }
        }
        Err(RaftError::QuorumUnavailable {
            group: self.config.group_id,
        })
    }

    /// Wait until `last_applied >= index` or the timeout elapses. Cancelled
    /// waits drop their waiter without touching partition state.
    pub async fn wait_applied(
        &self,
        index: LogIndex,
        timeout: Duration,
    ) -> Result<LogIndex, RaftError> {
        let rx = {
            let mut st = self.state.lock().await;
            if st.last_applied >= index {
                return Ok(st.last_applied);
            }
            let (tx, rx) = oneshot::channel();
            st.apply_waiters.push(ApplyWaiter { index, tx });
            rx
        };
        match time::timeout(timeout, rx).await {
            Err(_) => Err(RaftError::Timeout),
            Ok(Err(_)) => Err(RaftError::LeadershipLost),
            Ok(Ok(result)) => result,
        }
    }

    /// Applied cursor of the local replica, for timeline read validation.
    pub async fn applied_index(&self) -> LogIndex {
        self.state.lock().await.last_applied
    }

    // ------------------------------------------------------------------
    // Apply loop
    // ------------------------------------------------------------------

    async fn run_apply(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let next = {
                let st = self.state.lock().await;
                if st.corrupt_at.is_some() {
                    return;
                }
                if st.last_applied >= st.commit_index {
                    None
                } else {
                    Some(st.last_applied + 1)
                }
            };
            let Some(next) = next else {
                self.apply_notify.notified().await;
                continue;
            };

            let entry = match self.log.entry(next) {
                Ok(Some(entry)) => entry,
                other => {
                    // A committed index we cannot read back is unrecoverable
                    // locally. Halt the group; the control plane rebuilds
                    // this replica from a peer.
                    let outcome = other.map(|e| e.map(|_| ()));
                    tracing::error!(
                        group = self.config.group_id,
                        index = next,
                        result = ?outcome,
                        "committed log entry unreadable; halting partition"
                    );
                    let mut st = self.state.lock().await;
                    st.corrupt_at = Some(next);
                    let group = self.config.group_id;
                    st.fail_waiters(|| RaftError::LogCorrupt { group, index: next });
                    return;
                }
            };

            match entry.kind {
                EntryKind::Noop => {}
                EntryKind::Normal => self.sm.apply(next, &entry.command),
                EntryKind::ConfigChange => match decode_membership(&entry.command) {
                    Ok(membership) => self.install_membership(membership).await,
                    Err(err) => {
                        tracing::warn!(group = self.config.group_id, error = ?err, "bad config entry");
                    }
                },
            }

            let mut st = self.state.lock().await;
            st.last_applied = next;
            st.wake_applied(next);
        }
    }

    async fn install_membership(&self, membership: Membership) {
        let mut st = self.state.lock().await;
        tracing::info!(
            group = self.config.group_id,
            voters = ?membership.voters,
            learners = ?membership.learners,
            "membership change applied"
        );
        st.membership = membership;
        let self_id = self.config.node_id;
        if st.role == Role::Leader {
            let last = self.log.last_index();
            let members = st.membership.members();
            st.progress.retain(|id, _| members.contains(id));
            for id in members {
                if id != self_id && !st.progress.contains_key(&id) {
                    st.progress.insert(
                        id,
                        super::state::Progress {
                            next_index: last + 1,
                            match_index: 0,
                            inflight: false,
                        },
                    );
                }
            }
            if !st.membership.is_voter(self_id) {
                // Removed from the voter set: finish replicating as a bare
                // caretaker until a new leader emerges, but stop accepting
                // proposals.
                st.role = Role::NonVoter;
                st.fail_waiters(|| RaftError::LeadershipLost);
            }
        } else {
            st.role = if st.membership.is_voter(self_id) {
                Role::Follower
            } else {
                Role::NonVoter
            };
        }
    }

    // ------------------------------------------------------------------
    // Membership changes
    // ------------------------------------------------------------------

    /// Propose a new membership. At most one voter may change per step so
    /// two disjoint majorities can never coexist; learner changes are free.
    pub async fn change_membership(
        self: &Arc<Self>,
        next: Membership,
    ) -> Result<LogIndex, RaftError> {
        let mut next = next;
        next.normalize();
        {
            let st = self.state.lock().await;
            let delta = st.membership.voter_delta(&next);
            if delta > 1 {
                return Err(RaftError::Internal(anyhow::anyhow!(
                    "membership change alters {delta} voters; one at a time"
                )));
            }
        }
        let command = encode_membership(&next).map_err(RaftError::Internal)?;
        self.propose_entry(EntryKind::ConfigChange, command, None)
            .await
    }

    /// Hand leadership to `target`. Only proceeds when the target's log has
    /// fully caught up, so the transfer cannot regress committed state.
    pub async fn transfer_leadership(self: &Arc<Self>, target: NodeId) -> Result<(), RaftError> {
        let term = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    group: self.config.group_id,
                    leader: st.leader_hint,
                    current_epoch: st.routing_epoch,
                });
            }
            if !st.membership.is_voter(target) {
                return Err(RaftError::Internal(anyhow::anyhow!(
                    "transfer target {target} is not a voter"
                )));
            }
            let caught_up = st
                .progress
                .get(&target)
                .map(|p| p.match_index >= self.log.last_index())
                .unwrap_or(target == self.config.node_id);
            if !caught_up {
                return Err(RaftError::Internal(anyhow::anyhow!(
                    "transfer target {target} has not caught up"
                )));
            }
            st.term
        };
        if target == self.config.node_id {
            return Ok(());
        }
        self.transport
            .timeout_now(target, self.config.group_id, term)
            .await
            .map_err(RaftError::Internal)?;
        Ok(())
    }

    /// `timeout_now` receiver: campaign immediately on the leader's request.
    pub async fn handle_timeout_now(self: &Arc<Self>, term: Term) -> anyhow::Result<()> {
        {
            let st = self.state.lock().await;
            if term < st.term || !st.membership.is_voter(self.config.node_id) {
                return Ok(());
            }
        }
        self.start_election().await;
        Ok(())
    }

    /// Replication lag of one peer as seen by the leader, in log entries.
    /// `None` when this node does not lead the group or does not track the
    /// peer.
    pub async fn peer_lag(&self, peer: NodeId) -> Option<u64> {
        let st = self.state.lock().await;
        if st.role != Role::Leader {
            return None;
        }
        let last = self.log.last_index();
        st.progress
            .get(&peer)
            .map(|p| last.saturating_sub(p.match_index))
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture a snapshot image of the state machine. The caller persists
    /// the image and then calls `compact` to release the covered prefix.
    pub async fn snapshot_now(&self) -> anyhow::Result<(LogIndex, Term, Vec<u8>)> {
        let data = self.sm.snapshot()?;
        let index = self.sm.applied_index();
        let term = self.term_at(index)?.unwrap_or(0);
        Ok((index, term, data))
    }

    /// Drop log entries at or below `index`. `index` must be applied.
    pub async fn compact(&self, index: LogIndex) -> anyhow::Result<()> {
        let applied = { self.state.lock().await.last_applied };
        anyhow::ensure!(
            index <= applied,
            "compaction index {index} ahead of applied {applied}"
        );
        let term = self.term_at(index)?.unwrap_or(0);
        self.log.compact_to(index, term)
    }

    async fn send_snapshot_to(self: &Arc<Self>, peer: NodeId) -> anyhow::Result<()> {
        let (term, membership) = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return Ok(());
            }
            (st.term, st.membership.clone())
        };
        let (snapshot_index, snapshot_term, data) = self.snapshot_now().await?;
        let digest = *blake3::hash(&data).as_bytes();
        let total_len = data.len() as u64;

        let mut offset = 0u64;
        loop {
            let start = offset as usize;
            let end = (start + SNAPSHOT_CHUNK_BYTES).min(data.len());
            let done = end == data.len();
            let req = SnapshotChunkRequest {
                group_id: self.config.group_id,
                term,
                leader: self.config.node_id,
                snapshot_index,
                snapshot_term,
                membership: membership.clone(),
                offset,
                data: data[start..end].to_vec(),
                total_len,
                digest,
                done,
            };
            let resp = time::timeout(
                self.config.rpc_timeout,
                self.transport.install_snapshot(peer, req),
            )
            .await
            .context("snapshot chunk timed out")??;

            if resp.term > term {
                let mut st = self.state.lock().await;
                if resp.term > st.term {
                    st.step_down(self.config.node_id, resp.term, self.band());
                    st.fail_waiters(|| RaftError::LeadershipLost);
                    let _ = self.log.save_hard_state(&st.hard_state());
                }
                anyhow::bail!("peer {peer} reported higher term during snapshot");
            }
            if !resp.ok {
                // Resume from wherever the receiver got to.
                offset = resp.next_offset.min(total_len);
                continue;
            }
            if done {
                break;
            }
            offset = end as u64;
        }

        let mut st = self.state.lock().await;
        if let Some(prog) = st.progress.get_mut(&peer) {
            prog.match_index = prog.match_index.max(snapshot_index);
            prog.next_index = snapshot_index + 1;
        }
        tracing::info!(
            group = self.config.group_id,
            peer,
            snapshot_index,
            "snapshot installed on peer"
        );
        Ok(())
    }

    pub async fn handle_install_snapshot(
        &self,
        req: SnapshotChunkRequest,
    ) -> anyhow::Result<SnapshotChunkResponse> {
        let mut st = self.state.lock().await;
        if req.term < st.term {
            return Ok(SnapshotChunkResponse {
                term: st.term,
                ok: false,
                next_offset: 0,
            });
        }
        if req.term > st.term {
            st.term = req.term;
            st.voted_for = None;
            self.log
                .save_hard_state(&st.hard_state())
                .context("persist term bump")?;
        }
        st.leader_hint = Some(req.leader);
        st.reset_election_deadline(self.band());

        let pending = st.pending_snapshot.get_or_insert_with(PendingSnapshot::default);
        if pending.snapshot_index != req.snapshot_index || pending.buf.len() as u64 != req.offset {
            if req.offset != 0 {
                // Stream restarted or reordered; tell the sender where to
                // resume.
                let next = if pending.snapshot_index == req.snapshot_index {
                    pending.buf.len() as u64
                } else {
                    0
                };
                return Ok(SnapshotChunkResponse {
                    term: st.term,
                    ok: false,
                    next_offset: next,
                });
            }
            pending.buf.clear();
            pending.snapshot_index = req.snapshot_index;
            pending.snapshot_term = req.snapshot_term;
        }
        pending.buf.extend_from_slice(&req.data);

        if !req.done {
            let next = pending.buf.len() as u64;
            return Ok(SnapshotChunkResponse {
                term: st.term,
                ok: true,
                next_offset: next,
            });
        }

        let Some(image) = st.pending_snapshot.take() else {
            return Ok(SnapshotChunkResponse {
                term: st.term,
                ok: false,
                next_offset: 0,
            });
        };
        if image.buf.len() as u64 != req.total_len
            || *blake3::hash(&image.buf).as_bytes() != req.digest
        {
            tracing::warn!(
                group = self.config.group_id,
                "snapshot digest mismatch; restarting transfer"
            );
            return Ok(SnapshotChunkResponse {
                term: st.term,
                ok: false,
                next_offset: 0,
            });
        }

        self.sm
            .restore(image.snapshot_index, &image.buf)
            .context("restore snapshot")?;
        self.log
            .truncate_from(self.log.first_index().max(1))
            .context("clear log for snapshot")?;
        self.log
            .compact_to(image.snapshot_index, image.snapshot_term)
            .context("set snapshot boundary")?;

        st.membership = req.membership;
        st.role = if st.membership.is_voter(self.config.node_id) {
            Role::Follower
        } else {
            Role::NonVoter
        };
        st.commit_index = st.commit_index.max(image.snapshot_index);
        st.last_applied = image.snapshot_index;
        st.wake_applied(image.snapshot_index);
        tracing::info!(
            group = self.config.group_id,
            snapshot_index = image.snapshot_index,
            "snapshot restored"
        );
        Ok(SnapshotChunkResponse {
            term: st.term,
            ok: true,
            next_offset: req.total_len,
        })
    }
}

fn encode_membership(m: &Membership) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(m).context("encode membership")
}

fn decode_membership(data: &[u8]) -> anyhow::Result<Membership> {
    serde_json::from_slice(data).context("decode membership")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{Config, MemLogStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::RwLock as StdRwLock;

    /// Accumulating state machine for tests.
    struct VecSm {
        inner: StdRwLock<(u64, Vec<(u64, Vec<u8>)>)>,
    }

    impl VecSm {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: StdRwLock::new((0, Vec::new())),
            })
        }

        fn entries(&self) -> Vec<(u64, Vec<u8>)> {
            self.inner.read().unwrap().1.clone()
        }
    }

    impl StateMachine for VecSm {
        fn apply(&self, index: LogIndex, command: &[u8]) {
            let mut inner = self.inner.write().unwrap();
            if index <= inner.0 {
                return;
            }
            inner.0 = index;
            inner.1.push((index, command.to_vec()));
        }

        fn applied_index(&self) -> LogIndex {
            self.inner.read().unwrap().0
        }

        fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
            Ok(serde_json::to_vec(&self.inner.read().unwrap().1)?)
        }

        fn restore(&self, index: LogIndex, data: &[u8]) -> anyhow::Result<()> {
            let rows: Vec<(u64, Vec<u8>)> = serde_json::from_slice(data)?;
            *self.inner.write().unwrap() = (index, rows);
            Ok(())
        }
    }

    /// Direct-dispatch transport over a shared registry.
    #[derive(Default)]
    struct TestMesh {
        groups: StdRwLock<HashMap<NodeId, Arc<Group>>>,
    }

    impl TestMesh {
        fn register(&self, node: NodeId, group: Arc<Group>) {
            self.groups.write().unwrap().insert(node, group);
        }

        fn get(&self, node: NodeId) -> anyhow::Result<Arc<Group>> {
            self.groups
                .read()
                .unwrap()
                .get(&node)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown node {node}"))
        }
    }

    #[async_trait]
    impl Transport for TestMesh {
        async fn request_vote(
            &self,
            target: NodeId,
            req: VoteRequest,
        ) -> anyhow::Result<VoteResponse> {
            self.get(target)?.handle_request_vote(req).await
        }

        async fn append_entries(
            &self,
            target: NodeId,
            req: AppendEntriesRequest,
        ) -> anyhow::Result<AppendEntriesResponse> {
            self.get(target)?.handle_append_entries(req).await
        }

        async fn install_snapshot(
            &self,
            target: NodeId,
            req: SnapshotChunkRequest,
        ) -> anyhow::Result<SnapshotChunkResponse> {
            self.get(target)?.handle_install_snapshot(req).await
        }

        async fn timeout_now(
            &self,
            target: NodeId,
            _group_id: crate::raft::GroupId,
            term: Term,
        ) -> anyhow::Result<()> {
            self.get(target)?.handle_timeout_now(term).await
        }
    }

    fn test_config(node: NodeId, voters: Vec<NodeId>) -> Config {
        let mut cfg = Config::new(7, node, Membership::new(voters, vec![]));
        cfg.election_timeout_min = Duration::from_millis(50);
        cfg.election_timeout_max = Duration::from_millis(120);
        cfg.heartbeat_interval = Duration::from_millis(20);
        cfg
    }

    async fn wait_for_leader(groups: &[Arc<Group>]) -> Arc<Group> {
        for _ in 0..200 {
            for g in groups {
                if g.status().await.role == Role::Leader {
                    return Arc::clone(g);
                }
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no leader elected");
    }

    #[tokio::test]
    async fn single_voter_commits_locally() {
        let mesh = Arc::new(TestMesh::default());
        let sm = VecSm::new();
        let group = Group::new(
            test_config(1, vec![1]),
            mesh.clone(),
            sm.clone(),
            Arc::new(MemLogStore::new()),
        )
        .unwrap();
        mesh.register(1, Arc::clone(&group));
        group.start();

        let leader = wait_for_leader(&[Arc::clone(&group)]).await;
        let index = leader.propose(b"hello".to_vec(), None).await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(sm.entries(), vec![(1, b"hello".to_vec())]);
        assert_eq!(leader.read_index().await.unwrap(), 1);
        group.stop();
    }

    #[tokio::test]
    async fn three_voters_replicate_and_fence_epochs() {
        let mesh = Arc::new(TestMesh::default());
        let sms: Vec<_> = (0..3).map(|_| VecSm::new()).collect();
        let mut groups = Vec::new();
        for node in 1..=3u64 {
            let group = Group::new(
                test_config(node, vec![1, 2, 3]),
                mesh.clone(),
                sms[(node - 1) as usize].clone(),
                Arc::new(MemLogStore::new()),
            )
            .unwrap();
            mesh.register(node, Arc::clone(&group));
            groups.push(group);
        }
        for g in &groups {
            g.install_epoch(4).await;
            g.start();
        }

        let leader = wait_for_leader(&groups).await;
        leader.propose(b"k1".to_vec(), Some(4)).await.unwrap();

        let err = leader.propose(b"k2".to_vec(), Some(3)).await.unwrap_err();
        assert!(matches!(err, RaftError::EpochConflict { presented: 3, current: 4 }));

        // All replicas converge on the committed entry.
        for _ in 0..200 {
            if sms.iter().all(|sm| !sm.entries().is_empty()) {
                break;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        for sm in &sms {
            assert_eq!(sm.entries()[0].1, b"k1".to_vec());
        }
        for g in &groups {
            g.stop();
        }
    }

    #[tokio::test]
    async fn non_voter_catches_up_and_promotes() {
        let mesh = Arc::new(TestMesh::default());
        let sm1 = VecSm::new();
        let group1 = Group::new(
            test_config(1, vec![1]),
            mesh.clone(),
            sm1.clone(),
            Arc::new(MemLogStore::new()),
        )
        .unwrap();
        mesh.register(1, Arc::clone(&group1));
        group1.start();
        let leader = wait_for_leader(&[Arc::clone(&group1)]).await;
        for i in 0..5u8 {
            leader.propose(vec![i], None).await.unwrap();
        }

        // Bring up node 2 as a learner.
        let sm2 = VecSm::new();
        let mut cfg2 = test_config(2, vec![1]);
        cfg2.membership = Membership::new(vec![1], vec![2]);
        let group2 = Group::new(cfg2, mesh.clone(), sm2.clone(), Arc::new(MemLogStore::new())).unwrap();
        mesh.register(2, Arc::clone(&group2));
        group2.start();

        leader
            .change_membership(Membership::new(vec![1], vec![2]))
            .await
            .unwrap();

        for _ in 0..200 {
            if sm2.applied_index() >= 5 {
                break;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        assert!(sm2.applied_index() >= 5, "learner failed to catch up");
        assert_eq!(group2.status().await.role, Role::NonVoter);

        // Promote once caught up.
        leader
            .change_membership(Membership::new(vec![1, 2], vec![]))
            .await
            .unwrap();
        for _ in 0..200 {
            if group2.status().await.role == Role::Follower {
                break;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(group2.status().await.role, Role::Follower);
        group1.stop();
        group2.stop();
    }
}
