//! Per-partition replication coordinator
//!
//! Each partition a node hosts gets a `PartitionReplica`: a
//! Follower/Candidate/Leader state machine transitioned only by explicit
//! events (metadata commits, higher-term observations, failover
//! candidacy). The leader assigns offsets, fans entries out to
//! followers, and commits on majority acknowledgment; followers enforce
//! log matching and truncate divergent uncommitted suffixes.

use crate::common::{validate_key, Error, NodeId, ReplicationConfig, Result};
use crate::membership::Membership;
use crate::meta::partition::{Partition, PartitionMap};
use crate::net::message::{AppendRequest, AppendResponse, ClientOp, OpResult, PeerMessage};
use crate::net::transport::Transport;
use crate::repl::log::{AppendOutcome, LogEntry, ReplicationLog};
use crate::storage::StorageEngine;
use crate::sync::engine::SyncEngine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const BACKFILL_BATCH: usize = 64;

/// Replica role for one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaRole::Follower => write!(f, "follower"),
            ReplicaRole::Candidate => write!(f, "candidate"),
            ReplicaRole::Leader => write!(f, "leader"),
        }
    }
}

/// Replicated write operation carried as an entry payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

struct Inner {
    role: ReplicaRole,
    term: u64,
    leader: Option<NodeId>,
    replicas: Vec<NodeId>,
    log: ReplicationLog,
}

struct Pending {
    tx: oneshot::Sender<Result<u64>>,
}

pub struct PartitionReplica {
    partition: u64,
    node_id: NodeId,
    cfg: ReplicationConfig,
    inner: Mutex<Inner>,
    /// Waiters for quorum acknowledgment, keyed by offset
    pending: Mutex<BTreeMap<u64, Pending>>,
    /// Cumulative acknowledged offset per follower
    match_offsets: Mutex<HashMap<NodeId, u64>>,
    backfilling: Mutex<HashSet<NodeId>>,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn StorageEngine>,
    membership: Membership,
    sync: Arc<SyncEngine>,
    fallback_addrs: HashMap<NodeId, String>,
    apply_tx: mpsc::UnboundedSender<LogEntry>,
}

impl PartitionReplica {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition: u64,
        node_id: NodeId,
        cfg: ReplicationConfig,
        log: ReplicationLog,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StorageEngine>,
        membership: Membership,
        sync: Arc<SyncEngine>,
        fallback_addrs: HashMap<NodeId, String>,
    ) -> Arc<Self> {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();

        // re-feed committed entries after restart; the engine's applied
        // watermark makes re-delivery a no-op
        let committed = log.committed_entries_from(log.start_offset(), usize::MAX);

        let replica = Arc::new(Self {
            partition,
            node_id,
            cfg,
            inner: Mutex::new(Inner {
                role: ReplicaRole::Follower,
                term: 0,
                leader: None,
                replicas: Vec::new(),
                log,
            }),
            pending: Mutex::new(BTreeMap::new()),
            match_offsets: Mutex::new(HashMap::new()),
            backfilling: Mutex::new(HashSet::new()),
            transport,
            storage,
            membership,
            sync,
            fallback_addrs,
            apply_tx,
        });

        for entry in committed {
            let _ = replica.apply_tx.send(entry);
        }

        replica.spawn_apply_task(apply_rx);
        replica.spawn_heartbeat_task();
        replica
    }

    fn spawn_apply_task(self: &Arc<Self>, mut apply_rx: mpsc::UnboundedReceiver<LogEntry>) {
        let storage = self.storage.clone();
        let partition = self.partition;
        tokio::spawn(async move {
            while let Some(entry) = apply_rx.recv().await {
                let op: WriteOp = match bincode::deserialize(&entry.payload) {
                    Ok(op) => op,
                    Err(e) => {
                        tracing::error!(
                            "undecodable entry at partition {} offset {}: {}",
                            partition,
                            entry.offset,
                            e
                        );
                        continue;
                    }
                };
                let res = match op {
                    WriteOp::Put { key, value } => {
                        storage.put(partition, entry.offset, &key, value).await
                    }
                    WriteOp::Delete { key } => {
                        storage.delete(partition, entry.offset, &key).await
                    }
                };
                if let Err(e) = res {
                    tracing::error!(
                        "apply failed at partition {} offset {}: {}",
                        partition,
                        entry.offset,
                        e
                    );
                }
            }
        });
    }

    fn spawn_heartbeat_task(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval_ms = self.cfg.heartbeat_interval_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(replica) => replica.heartbeat(),
                    None => break,
                }
            }
        });
    }

    pub fn partition(&self) -> u64 {
        self.partition
    }

    pub fn role(&self) -> ReplicaRole {
        self.inner.lock().unwrap().role
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().unwrap().term
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.inner.lock().unwrap().leader.clone()
    }

    pub fn commit_offset(&self) -> u64 {
        self.inner.lock().unwrap().log.commit_offset()
    }

    /// (term, last offset) for failover queries
    pub fn log_status(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.term, inner.log.last_offset())
    }

    /// (start, last, commit, term) for the sync engine
    pub fn log_bounds(&self) -> (u64, u64, u64, u64) {
        let inner = self.inner.lock().unwrap();
        (
            inner.log.start_offset(),
            inner.log.last_offset(),
            inner.log.commit_offset(),
            inner.term,
        )
    }

    pub fn committed_entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.inner
            .lock()
            .unwrap()
            .log
            .committed_entries_from(from, max)
    }

    /// Term of the entry at `offset`, if retained
    pub fn term_at(&self, offset: u64) -> Option<u64> {
        self.inner.lock().unwrap().log.term_at(offset)
    }

    fn addr_of(&self, node: &str) -> Option<String> {
        self.membership
            .view()
            .addr_of(node)
            .or_else(|| self.fallback_addrs.get(node).cloned())
    }

    /// Adopt the partition's metadata. Role transitions happen only here
    /// and on higher-term observations from peers.
    pub fn reconcile(self: &Arc<Self>, p: &Partition) {
        let me = self.node_id.as_str();
        let (became_leader, deposed, new_follower) = {
            let mut inner = self.inner.lock().unwrap();
            inner.replicas = p.replicas.clone();
            if p.term > inner.term {
                inner.term = p.term;
                if p.leader == me {
                    inner.role = ReplicaRole::Leader;
                    inner.leader = Some(self.node_id.clone());
                    (true, false, false)
                } else {
                    let deposed = inner.role == ReplicaRole::Leader;
                    inner.role = ReplicaRole::Follower;
                    inner.leader = Some(p.leader.clone());
                    (false, deposed, true)
                }
            } else if p.term == inner.term {
                if p.leader == me && inner.role != ReplicaRole::Leader {
                    inner.role = ReplicaRole::Leader;
                    inner.leader = Some(self.node_id.clone());
                    (true, false, false)
                } else if p.leader != me && inner.role == ReplicaRole::Candidate {
                    inner.role = ReplicaRole::Follower;
                    inner.leader = Some(p.leader.clone());
                    (false, false, true)
                } else {
                    (false, false, false)
                }
            } else {
                (false, false, false)
            }
        };

        if deposed {
            self.fail_pending(None);
        }
        if became_leader {
            tracing::info!(
                "partition {}: leader at term {}",
                self.partition,
                p.term
            );
            self.match_offsets.lock().unwrap().clear();
            let replica = self.clone();
            tokio::spawn(async move {
                replica.heartbeat();
            });
        }
        if new_follower {
            // ask the new leader for catch-up; a no-op when already current
            let replica = self.clone();
            tokio::spawn(async move {
                replica.request_sync().await;
            });
        }
    }

    /// Failover marked us as the preferred next leader; hold Candidate
    /// until the metadata commit resolves it.
    pub fn begin_candidacy(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.role == ReplicaRole::Follower {
            inner.role = ReplicaRole::Candidate;
            tracing::info!("partition {}: candidate", self.partition);
        }
    }

    async fn request_sync(&self) {
        let (leader, last_offset) = {
            let inner = self.inner.lock().unwrap();
            (inner.leader.clone(), inner.log.last_offset())
        };
        let leader = match leader {
            Some(l) if l != self.node_id => l,
            _ => return,
        };
        let addr = match self.addr_of(&leader) {
            Some(a) => a,
            None => return,
        };
        let msg = PeerMessage::SyncRequest {
            partition: self.partition,
            follower: self.node_id.clone(),
            last_offset,
        };
        if let Err(e) = self.transport.call(&addr, msg).await {
            tracing::debug!(
                "sync request for partition {} to {} failed: {}",
                self.partition,
                leader,
                e
            );
        }
    }

    fn step_down(&self, new_term: u64, leader: Option<NodeId>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if new_term < inner.term {
                return;
            }
            inner.term = new_term;
            inner.role = ReplicaRole::Follower;
            inner.leader = leader.clone();
        }
        tracing::info!(
            "partition {}: stepping down at term {}",
            self.partition,
            new_term
        );
        self.match_offsets.lock().unwrap().clear();
        self.fail_pending(leader);
    }

    fn fail_pending(&self, leader: Option<NodeId>) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending).into_values().collect()
        };
        for p in drained {
            let _ = p.tx.send(Err(Error::NotLeader {
                partition: self.partition,
                leader: leader.clone(),
            }));
        }
    }

    // === leader path ===

    /// Append a replicated operation; resolves once a majority
    /// (ourselves included) has durably stored it. Dropping the future
    /// stops the local wait only; the entry may still commit.
    pub async fn append(self: &Arc<Self>, payload: Vec<u8>) -> Result<u64> {
        let (offset, term, entry, prev_offset, prev_term, followers, commit_offset, majority) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != ReplicaRole::Leader {
                return Err(Error::NotLeader {
                    partition: self.partition,
                    leader: inner.leader.clone(),
                });
            }
            let term = inner.term;
            let prev_offset = inner.log.last_offset();
            let prev_term = inner.log.term_at(prev_offset).unwrap_or(0);
            let offset = inner.log.append(term, payload)?;
            let entry = inner.log.entry(offset).cloned().unwrap();
            let followers: Vec<NodeId> = inner
                .replicas
                .iter()
                .filter(|r| **r != self.node_id)
                .cloned()
                .collect();
            let majority = inner.replicas.len() / 2 + 1;
            (
                offset,
                term,
                entry,
                prev_offset,
                prev_term,
                followers,
                inner.log.commit_offset(),
                majority,
            )
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(offset, Pending { tx });

        if majority <= 1 {
            self.commit_to(offset);
        }

        for follower in followers {
            let req = AppendRequest {
                partition: self.partition,
                term,
                leader: self.node_id.clone(),
                prev_offset,
                prev_term,
                entries: vec![entry.clone()],
                commit_offset,
            };
            self.send_append(follower, req);
        }

        let deadline = Duration::from_millis(self.cfg.append_timeout_ms);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal("append waiter dropped".into())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&offset);
                Err(Error::Timeout(format!(
                    "append quorum wait for partition {} offset {}",
                    self.partition, offset
                )))
            }
        }
    }

    fn send_append(self: &Arc<Self>, follower: NodeId, req: AppendRequest) {
        let replica = self.clone();
        tokio::spawn(async move {
            let addr = match replica.addr_of(&follower) {
                Some(a) => a,
                None => return,
            };
            let deadline = Duration::from_millis(replica.cfg.append_timeout_ms);
            match tokio::time::timeout(
                deadline,
                replica.transport.call(&addr, PeerMessage::Append(req)),
            )
            .await
            {
                Ok(Ok(PeerMessage::AppendAck(resp))) => {
                    replica.handle_append_response(&follower, resp);
                }
                Ok(Ok(PeerMessage::Failure(e))) => {
                    tracing::debug!("append to {} rejected: {:?}", follower, e);
                }
                Ok(Ok(other)) => {
                    tracing::debug!("unexpected append reply from {}: {:?}", follower, other);
                }
                Ok(Err(e)) => {
                    tracing::debug!("append to {} failed: {}", follower, e);
                }
                Err(_) => {
                    tracing::debug!("append to {} timed out", follower);
                }
            }
        });
    }

    /// Process a follower's acknowledgment; advances the commit point
    /// when a majority has stored a prefix.
    pub fn handle_append_response(self: &Arc<Self>, from: &str, resp: AppendResponse) {
        let (role, term) = {
            let inner = self.inner.lock().unwrap();
            (inner.role, inner.term)
        };
        if resp.term > term {
            self.step_down(resp.term, None);
            return;
        }
        if role != ReplicaRole::Leader || resp.term < term {
            return;
        }

        if !resp.success {
            if resp.conflict_offset > 0 {
                self.backfill(from.to_string(), resp.conflict_offset);
            }
            return;
        }

        let quorum_offset = {
            let inner = self.inner.lock().unwrap();
            let self_last = inner.log.last_offset();
            let mut matches = self.match_offsets.lock().unwrap();
            let m = matches.entry(from.to_string()).or_insert(0);
            *m = (*m).max(resp.last_offset);
            let mut offsets: Vec<u64> = inner
                .replicas
                .iter()
                .map(|r| {
                    if *r == self.node_id {
                        self_last
                    } else {
                        matches.get(r).copied().unwrap_or(0)
                    }
                })
                .collect();
            offsets.sort_unstable_by(|a, b| b.cmp(a));
            let majority = inner.replicas.len() / 2 + 1;
            offsets.get(majority - 1).copied().unwrap_or(0)
        };

        if quorum_offset > 0 {
            self.commit_to(quorum_offset);
        }
    }

    /// Advance the commit watermark, apply newly committed entries, wake
    /// waiters and notify followers.
    fn commit_to(self: &Arc<Self>, offset: u64) {
        let (newly, term, followers, commit) = {
            let mut inner = self.inner.lock().unwrap();
            if offset <= inner.log.commit_offset() {
                return;
            }
            let newly = match inner.log.set_commit(offset) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(
                        "commit advance failed on partition {}: {}",
                        self.partition,
                        e
                    );
                    return;
                }
            };
            let followers: Vec<NodeId> = inner
                .replicas
                .iter()
                .filter(|r| **r != self.node_id)
                .cloned()
                .collect();
            (newly, inner.term, followers, inner.log.commit_offset())
        };

        for entry in newly {
            let _ = self.apply_tx.send(entry);
        }

        let resolved: Vec<(u64, Pending)> = {
            let mut pending = self.pending.lock().unwrap();
            let keep = pending.split_off(&(commit + 1));
            std::mem::replace(&mut *pending, keep).into_iter().collect()
        };
        for (offset, p) in resolved {
            let _ = p.tx.send(Ok(offset));
        }

        let replica = self.clone();
        tokio::spawn(async move {
            for follower in followers {
                let addr = match replica.addr_of(&follower) {
                    Some(a) => a,
                    None => continue,
                };
                let msg = PeerMessage::CommitNotice {
                    partition: replica.partition,
                    term,
                    commit_offset: commit,
                };
                if let Err(e) = replica.transport.call(&addr, msg).await {
                    tracing::trace!("commit notice to {} failed: {}", follower, e);
                }
            }
        });
    }

    /// Resend entries from the follower's divergence point; switches to a
    /// snapshot session when the range has been compacted away.
    fn backfill(self: &Arc<Self>, follower: NodeId, from: u64) {
        {
            let mut active = self.backfilling.lock().unwrap();
            if !active.insert(follower.clone()) {
                return;
            }
        }
        let replica = self.clone();
        tokio::spawn(async move {
            replica.run_backfill(&follower, from).await;
            replica.backfilling.lock().unwrap().remove(&follower);
        });
    }

    async fn run_backfill(self: &Arc<Self>, follower: &str, mut from: u64) {
        let addr = match self.addr_of(follower) {
            Some(a) => a,
            None => return,
        };
        for _ in 0..1024 {
            let (term, start, last, commit, entries, prev_term) = {
                let inner = self.inner.lock().unwrap();
                if inner.role != ReplicaRole::Leader {
                    return;
                }
                (
                    inner.term,
                    inner.log.start_offset(),
                    inner.log.last_offset(),
                    inner.log.commit_offset(),
                    inner.log.entries_from(from, BACKFILL_BATCH),
                    inner.log.term_at(from.saturating_sub(1)),
                )
            };

            if from < start {
                // history gone; hand over to the sync engine
                self.sync
                    .request(self.partition, follower.to_string(), from.saturating_sub(1));
                return;
            }
            if entries.is_empty() || from > last {
                return;
            }
            let prev_term = match prev_term {
                Some(t) => t,
                None => return,
            };

            let req = AppendRequest {
                partition: self.partition,
                term,
                leader: self.node_id.clone(),
                prev_offset: from - 1,
                prev_term,
                entries,
                commit_offset: commit,
            };
            let deadline = Duration::from_millis(self.cfg.append_timeout_ms);
            let resp = match tokio::time::timeout(
                deadline,
                self.transport.call(&addr, PeerMessage::Append(req)),
            )
            .await
            {
                Ok(Ok(PeerMessage::AppendAck(resp))) => resp,
                _ => return,
            };

            if resp.term > term {
                self.step_down(resp.term, None);
                return;
            }
            if resp.success {
                self.handle_append_response(follower, resp.clone());
                if resp.last_offset >= last {
                    return;
                }
                from = resp.last_offset + 1;
            } else if resp.conflict_offset > 0 && resp.conflict_offset < from {
                from = resp.conflict_offset;
            } else {
                return;
            }
        }
    }

    /// Leader heartbeat: an empty append that asserts leadership,
    /// propagates the commit point and surfaces follower divergence.
    pub fn heartbeat(self: &Arc<Self>) {
        let (role, term, prev_offset, prev_term, commit, followers) = {
            let inner = self.inner.lock().unwrap();
            let prev_offset = inner.log.last_offset();
            (
                inner.role,
                inner.term,
                prev_offset,
                inner.log.term_at(prev_offset).unwrap_or(0),
                inner.log.commit_offset(),
                inner
                    .replicas
                    .iter()
                    .filter(|r| **r != self.node_id)
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };
        if role != ReplicaRole::Leader {
            return;
        }
        for follower in followers {
            let req = AppendRequest {
                partition: self.partition,
                term,
                leader: self.node_id.clone(),
                prev_offset,
                prev_term,
                entries: Vec::new(),
                commit_offset: commit,
            };
            self.send_append(follower, req);
        }
    }

    // === follower path ===

    /// Accept (or reject) a replication batch from the leader.
    pub fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse> {
        let mut was_leader = false;
        let (response, newly) = {
            let mut inner = self.inner.lock().unwrap();

            if req.term < inner.term {
                return Ok(AppendResponse {
                    partition: self.partition,
                    from: self.node_id.clone(),
                    term: inner.term,
                    success: false,
                    last_offset: inner.log.last_offset(),
                    conflict_offset: 0,
                });
            }
            if req.term > inner.term {
                was_leader = inner.role == ReplicaRole::Leader;
                inner.term = req.term;
                inner.role = ReplicaRole::Follower;
            } else if inner.role == ReplicaRole::Leader {
                // two leaders at one term would break the invariant set;
                // refuse and let metadata sort it out
                tracing::error!(
                    "partition {}: append from {} at our own term {}",
                    self.partition,
                    req.leader,
                    req.term
                );
                return Ok(AppendResponse {
                    partition: self.partition,
                    from: self.node_id.clone(),
                    term: inner.term,
                    success: false,
                    last_offset: inner.log.last_offset(),
                    conflict_offset: 0,
                });
            } else if inner.role == ReplicaRole::Candidate {
                inner.role = ReplicaRole::Follower;
            }
            inner.leader = Some(req.leader.clone());

            let outcome = inner
                .log
                .try_append(req.prev_offset, req.prev_term, &req.entries)?;
            match outcome {
                AppendOutcome::Accepted { last_offset } => {
                    let newly = inner.log.set_commit(req.commit_offset.min(last_offset))?;
                    (
                        AppendResponse {
                            partition: self.partition,
                            from: self.node_id.clone(),
                            term: inner.term,
                            success: true,
                            last_offset,
                            conflict_offset: 0,
                        },
                        newly,
                    )
                }
                AppendOutcome::Conflict { conflict_offset } => (
                    AppendResponse {
                        partition: self.partition,
                        from: self.node_id.clone(),
                        term: inner.term,
                        success: false,
                        last_offset: inner.log.last_offset(),
                        conflict_offset,
                    },
                    Vec::new(),
                ),
            }
        };

        if was_leader {
            self.match_offsets.lock().unwrap().clear();
            self.fail_pending(Some(req.leader));
        }
        for entry in newly {
            let _ = self.apply_tx.send(entry);
        }
        Ok(response)
    }

    /// Advance the commit point on the leader's notice.
    pub fn handle_commit_notice(&self, term: u64, commit_offset: u64) -> Result<()> {
        let newly = {
            let mut inner = self.inner.lock().unwrap();
            if term < inner.term {
                return Err(Error::TermMismatch {
                    partition: self.partition,
                    local: inner.term,
                    remote: term,
                });
            }
            inner.log.set_commit(commit_offset)?
        };
        for entry in newly {
            let _ = self.apply_tx.send(entry);
        }
        Ok(())
    }

    /// Accept a tail batch from a sync session; returns the cumulative
    /// acknowledged offset. `first_prev_term` is the leader's term for
    /// the entry directly below the batch, so a divergent suffix at the
    /// resume point is truncated instead of built upon.
    pub fn accept_tail(
        &self,
        first_prev_term: u64,
        entries: &[LogEntry],
        commit_offset: u64,
    ) -> Result<u64> {
        let (acked, newly) = {
            let mut inner = self.inner.lock().unwrap();
            let mut prev_term = first_prev_term;
            for entry in entries {
                let prev = entry.offset.saturating_sub(1);
                match inner
                    .log
                    .try_append(prev, prev_term, std::slice::from_ref(entry))?
                {
                    AppendOutcome::Accepted { .. } => {}
                    AppendOutcome::Conflict { .. } => break,
                }
                prev_term = entry.term;
            }
            let last = inner.log.last_offset();
            let newly = inner.log.set_commit(commit_offset.min(last))?;
            (last, newly)
        };
        for entry in newly {
            let _ = self.apply_tx.send(entry);
        }
        Ok(acked)
    }

    /// Adopt a restored snapshot boundary.
    pub fn reset_for_snapshot(&self, snapshot_offset: u64, term: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if snapshot_offset <= inner.log.commit_offset() {
            return Ok(());
        }
        inner.log.reset_to(snapshot_offset, term)?;
        tracing::info!(
            "partition {}: log reset to snapshot offset {}",
            self.partition,
            snapshot_offset
        );
        Ok(())
    }

    // === client operations ===

    pub async fn execute(self: &Arc<Self>, op: ClientOp) -> Result<OpResult> {
        match op {
            ClientOp::Put { key, value } => {
                validate_key(&key)?;
                let payload = bincode::serialize(&WriteOp::Put { key, value })
                    .map_err(|e| Error::Internal(format!("encode op: {}", e)))?;
                let offset = self.append(payload).await?;
                Ok(OpResult::Done { offset })
            }
            ClientOp::Delete { key } => {
                validate_key(&key)?;
                let payload = bincode::serialize(&WriteOp::Delete { key })
                    .map_err(|e| Error::Internal(format!("encode op: {}", e)))?;
                let offset = self.append(payload).await?;
                Ok(OpResult::Done { offset })
            }
            ClientOp::Get { key } => {
                self.ensure_leader()?;
                self.wait_applied().await?;
                let value = self.storage.get(self.partition, &key).await?;
                Ok(OpResult::Value { value })
            }
            ClientOp::Scan { start, end, limit } => {
                self.ensure_leader()?;
                self.wait_applied().await?;
                let entries = self.storage.scan(self.partition, &start, &end, limit).await?;
                Ok(OpResult::Range { entries })
            }
        }
    }

    /// Reads must observe everything at or below the commit point; the
    /// apply loop runs asynchronously, so briefly wait for it to catch
    /// up to the watermark captured at read time.
    async fn wait_applied(&self) -> Result<()> {
        let commit = self.commit_offset();
        for _ in 0..400 {
            if self.storage.applied_offset(self.partition).await? >= commit {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Err(Error::Timeout(format!(
            "apply loop lagging commit point on partition {}",
            self.partition
        )))
    }

    fn ensure_leader(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if inner.role != ReplicaRole::Leader {
            return Err(Error::NotLeader {
                partition: self.partition,
                leader: inner.leader.clone(),
            });
        }
        Ok(())
    }
}

/// All partition replicas hosted by this node, reconciled against the
/// partition map.
pub struct ReplicaRegistry {
    node_id: NodeId,
    cfg: ReplicationConfig,
    data_dir: Option<PathBuf>,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn StorageEngine>,
    membership: Membership,
    sync: Arc<SyncEngine>,
    fallback_addrs: HashMap<NodeId, String>,
    replicas: Mutex<HashMap<u64, Arc<PartitionReplica>>>,
}

impl ReplicaRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        cfg: ReplicationConfig,
        data_dir: Option<PathBuf>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StorageEngine>,
        membership: Membership,
        sync: Arc<SyncEngine>,
        fallback_addrs: HashMap<NodeId, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            cfg,
            data_dir,
            transport,
            storage,
            membership,
            sync,
            fallback_addrs,
            replicas: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, partition: u64) -> Option<Arc<PartitionReplica>> {
        self.replicas.lock().unwrap().get(&partition).cloned()
    }

    /// Role and term per hosted partition, for status reporting.
    pub fn roles(&self) -> Vec<(u64, ReplicaRole, u64)> {
        let replicas = self.replicas.lock().unwrap();
        let mut out: Vec<(u64, ReplicaRole, u64)> = replicas
            .values()
            .map(|r| (r.partition(), r.role(), r.term()))
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    /// Create or update replicas to match the committed partition map.
    pub fn reconcile_map(&self, map: &PartitionMap) {
        for p in map.partitions.values() {
            if !p.has_replica(&self.node_id) {
                // demote if we used to host it
                if let Some(replica) = self.get(p.id) {
                    replica.reconcile(p);
                }
                continue;
            }
            let replica = match self.get_or_create(p.id) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("cannot open partition {}: {}", p.id, e);
                    continue;
                }
            };
            replica.reconcile(p);
        }
    }

    fn get_or_create(&self, partition: u64) -> Result<Arc<PartitionReplica>> {
        if let Some(r) = self.get(partition) {
            return Ok(r);
        }
        let path = self
            .data_dir
            .as_ref()
            .map(|d| d.join(format!("p{}.log", partition)));
        let log = ReplicationLog::open(partition, path, self.cfg.retained_entries)?;
        let replica = PartitionReplica::new(
            partition,
            self.node_id.clone(),
            self.cfg.clone(),
            log,
            self.transport.clone(),
            self.storage.clone(),
            self.membership.clone(),
            self.sync.clone(),
            self.fallback_addrs.clone(),
        );
        self.replicas
            .lock()
            .unwrap()
            .insert(partition, replica.clone());
        Ok(replica)
    }

    /// Follow partition map updates.
    pub fn spawn_watch(self: &Arc<Self>, mut map_rx: watch::Receiver<PartitionMap>) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let map = map_rx.borrow_and_update().clone();
                if map.epoch > 0 {
                    registry.reconcile_map(&map);
                }
                if map_rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MembershipConfig, SyncConfig};
    use crate::net::mem::MemNet;
    use crate::net::transport::PeerHandler;
    use crate::storage::MemoryEngine;
    use std::time::Duration;

    /// Minimal peer: dispatches replication traffic to one replica.
    struct ReplicaHost {
        replica: Mutex<Option<Arc<PartitionReplica>>>,
    }

    impl ReplicaHost {
        fn empty() -> Arc<Self> {
            Arc::new(Self {
                replica: Mutex::new(None),
            })
        }

        fn set(&self, replica: Arc<PartitionReplica>) {
            *self.replica.lock().unwrap() = Some(replica);
        }
    }

    #[async_trait::async_trait]
    impl PeerHandler for ReplicaHost {
        async fn handle(&self, msg: PeerMessage) -> PeerMessage {
            let replica = match self.replica.lock().unwrap().clone() {
                Some(r) => r,
                None => return PeerMessage::failure(&Error::Internal("no replica".into())),
            };
            match msg {
                PeerMessage::Append(req) => match replica.handle_append(req) {
                    Ok(resp) => PeerMessage::AppendAck(resp),
                    Err(e) => PeerMessage::failure(&e),
                },
                PeerMessage::CommitNotice {
                    term,
                    commit_offset,
                    ..
                } => {
                    let _ = replica.handle_commit_notice(term, commit_offset);
                    PeerMessage::CommitNoticeAck
                }
                PeerMessage::SyncRequest { .. } => PeerMessage::SyncAck,
                other => {
                    let _ = other;
                    PeerMessage::failure(&Error::Internal("unsupported in test".into()))
                }
            }
        }
    }

    fn quiet_membership_cfg() -> MembershipConfig {
        MembershipConfig {
            probe_interval_ms: 3_600_000,
            ..MembershipConfig::default()
        }
    }

    fn make_replica(net: &MemNet, id: &str, replica_ids: &[&str]) -> Arc<PartitionReplica> {
        let addr = format!("mem://{}", id);
        let transport: Arc<dyn Transport> = Arc::new(net.transport(&addr));
        let (membership, _events) = Membership::spawn(
            quiet_membership_cfg(),
            id.to_string(),
            addr,
            transport.clone(),
        );
        let storage: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
        let sync = SyncEngine::new(
            SyncConfig::default(),
            transport.clone(),
            storage.clone(),
            membership.clone(),
        );
        let fallback: HashMap<String, String> = replica_ids
            .iter()
            .map(|r| (r.to_string(), format!("mem://{}", r)))
            .collect();
        let cfg = ReplicationConfig {
            heartbeat_interval_ms: 50,
            append_timeout_ms: 1000,
            ..ReplicationConfig::default()
        };
        let log = ReplicationLog::open(0, None, 1024).unwrap();
        PartitionReplica::new(
            0,
            id.to_string(),
            cfg,
            log,
            transport,
            storage,
            membership,
            sync,
            fallback,
        )
    }

    fn partition(replicas: &[&str], leader: &str, term: u64) -> Partition {
        Partition {
            id: 0,
            replicas: replicas.iter().map(|s| s.to_string()).collect(),
            leader: leader.to_string(),
            term,
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        let started = tokio::time::Instant::now();
        while !cond() {
            if started.elapsed() > Duration::from_secs(5) {
                panic!("condition not met");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_replica_append_commits_immediately() {
        let net = MemNet::new();
        let a = make_replica(&net, "a", &["a"]);
        a.reconcile(&partition(&["a"], "a", 1));
        assert_eq!(a.role(), ReplicaRole::Leader);

        let payload = bincode::serialize(&WriteOp::Put {
            key: "k".into(),
            value: b"v".to_vec(),
        })
        .unwrap();
        let offset = a.append(payload).await.unwrap();
        assert_eq!(offset, 1);
        assert_eq!(a.commit_offset(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn append_waits_for_majority_then_commits_followers() {
        let net = MemNet::new();
        let host_b = ReplicaHost::empty();
        let host_c = ReplicaHost::empty();
        net.register("mem://b", host_b.clone() as Arc<dyn PeerHandler>);
        net.register("mem://c", host_c.clone() as Arc<dyn PeerHandler>);
        // the leader's own address must be registered or its outbound
        // calls fail as isolated
        struct Sink;
        #[async_trait::async_trait]
        impl PeerHandler for Sink {
            async fn handle(&self, _msg: PeerMessage) -> PeerMessage {
                PeerMessage::failure(&Error::Internal("leader inbox unused".into()))
            }
        }
        net.register("mem://a", Arc::new(Sink));

        let replicas = ["a", "b", "c"];
        let a = make_replica(&net, "a", &replicas);
        let b = make_replica(&net, "b", &replicas);
        let c = make_replica(&net, "c", &replicas);
        host_b.set(b.clone());
        host_c.set(c.clone());

        a.reconcile(&partition(&replicas, "a", 1));
        b.reconcile(&partition(&replicas, "a", 1));
        c.reconcile(&partition(&replicas, "a", 1));

        let payload = bincode::serialize(&WriteOp::Put {
            key: "k".into(),
            value: b"v".to_vec(),
        })
        .unwrap();
        let offset = a.append(payload).await.unwrap();
        assert_eq!(offset, 1);
        assert_eq!(a.commit_offset(), 1);

        // commit notices propagate asynchronously
        wait_until(|| b.commit_offset() == 1 && c.commit_offset() == 1).await;
        assert_eq!(b.committed_entries_from(1, 10).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_term_append_is_rejected() {
        let net = MemNet::new();
        let b = make_replica(&net, "b", &["a", "b", "c"]);
        b.reconcile(&partition(&["a", "b", "c"], "a", 3));

        let req = AppendRequest {
            partition: 0,
            term: 2,
            leader: "a".into(),
            prev_offset: 0,
            prev_term: 0,
            entries: vec![LogEntry::new(2, 1, b"x".to_vec())],
            commit_offset: 0,
        };
        let resp = b.handle_append(req).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn higher_term_map_deposes_leader() {
        let net = MemNet::new();
        let a = make_replica(&net, "a", &["a", "b", "c"]);
        a.reconcile(&partition(&["a", "b", "c"], "a", 1));
        assert_eq!(a.role(), ReplicaRole::Leader);

        a.reconcile(&partition(&["a", "b", "c"], "b", 2));
        assert_eq!(a.role(), ReplicaRole::Follower);
        assert_eq!(a.term(), 2);
        assert_eq!(a.leader_hint().as_deref(), Some("b"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn candidacy_resolves_by_metadata_commit() {
        let net = MemNet::new();
        let b = make_replica(&net, "b", &["a", "b", "c"]);
        b.reconcile(&partition(&["a", "b", "c"], "a", 1));

        b.begin_candidacy();
        assert_eq!(b.role(), ReplicaRole::Candidate);

        // losing the election reverts to follower
        b.reconcile(&partition(&["a", "b", "c"], "c", 2));
        assert_eq!(b.role(), ReplicaRole::Follower);

        // winning a later one promotes to leader
        b.begin_candidacy();
        b.reconcile(&partition(&["a", "b", "c"], "b", 3));
        assert_eq!(b.role(), ReplicaRole::Leader);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gap_follower_asks_for_resend() {
        let net = MemNet::new();
        let b = make_replica(&net, "b", &["a", "b"]);
        b.reconcile(&partition(&["a", "b"], "a", 1));

        // entries start at offset 5; follower has nothing
        let req = AppendRequest {
            partition: 0,
            term: 1,
            leader: "a".into(),
            prev_offset: 4,
            prev_term: 1,
            entries: vec![LogEntry::new(1, 5, b"x".to_vec())],
            commit_offset: 4,
        };
        let resp = b.handle_append(req).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_offset, 1);
    }
}
