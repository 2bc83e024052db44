//! Sync engine: snapshot and stream-tail catch-up transfer
//!
//! The leader owns a session per lagging follower. Snapshot chunks are
//! lz4-compressed and shipped under a bounded in-flight window
//! (semaphore permits), so a slow follower pauses the leader instead of
//! growing its buffers; tail batches carry committed entries only.
//! Sessions resume from the follower's last acknowledged offset and are
//! destroyed on completion, follower departure, or idle timeout.

use crate::common::{blake3_hash, Error, NodeId, Result, SyncConfig};
use crate::membership::Membership;
use crate::net::message::{PeerMessage, SnapshotChunk, TailBatch};
use crate::net::transport::Transport;
use crate::repl::coordinator::{PartitionReplica, ReplicaRegistry, ReplicaRole};
use crate::storage::{StorageEngine, StorageSnapshot};
use crate::sync::session::{SnapStage, SyncMode, SyncSession};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

enum SessionEnd {
    /// Caught up (or no longer applicable); destroy the session
    Done,
    /// Transfer hit an error; keep the session for resumption
    Park,
}

pub struct SyncEngine {
    cfg: SyncConfig,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn StorageEngine>,
    membership: Membership,
    registry: OnceCell<Arc<ReplicaRegistry>>,
    sessions: Mutex<HashMap<(u64, NodeId), SyncSession>>,
    stages: Mutex<HashMap<Uuid, SnapStage>>,
}

impl SyncEngine {
    pub fn new(
        cfg: SyncConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StorageEngine>,
        membership: Membership,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            transport,
            storage,
            membership,
            registry: OnceCell::new(),
            sessions: Mutex::new(HashMap::new()),
            stages: Mutex::new(HashMap::new()),
        })
    }

    /// Wire up the replica registry after construction (the two own
    /// references to each other).
    pub fn set_registry(&self, registry: Arc<ReplicaRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// Current sessions, for status reporting.
    pub fn sessions(&self) -> Vec<SyncSession> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Create or resume the catch-up session for `follower`; the
    /// follower's reported `last_offset` is authoritative for resumption.
    pub fn request(self: &Arc<Self>, partition: u64, follower: NodeId, last_offset: u64) {
        let key = (partition, follower.clone());
        {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .entry(key)
                .or_insert_with(|| SyncSession::new(partition, follower.clone(), last_offset));
            session.acked_offset = last_offset;
            session.touch();
            if session.running {
                return;
            }
            session.running = true;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let end = engine.run_session(partition, follower.clone()).await;
            let key = (partition, follower);
            match end {
                SessionEnd::Done => {
                    if let Some(s) = engine.sessions.lock().unwrap().remove(&key) {
                        tracing::info!(
                            "sync session {} for partition {} complete at offset {}",
                            s.id,
                            partition,
                            s.acked_offset
                        );
                    }
                }
                SessionEnd::Park => {
                    if let Some(s) = engine.sessions.lock().unwrap().get_mut(&key) {
                        s.running = false;
                        s.touch();
                    }
                }
            }
        });
    }

    async fn run_session(self: &Arc<Self>, partition: u64, follower: NodeId) -> SessionEnd {
        let key = (partition, follower.clone());
        loop {
            let registry = match self.registry.get() {
                Some(r) => r.clone(),
                None => return SessionEnd::Park,
            };
            let replica = match registry.get(partition) {
                Some(r) => r,
                None => return SessionEnd::Done,
            };
            if replica.role() != ReplicaRole::Leader {
                return SessionEnd::Done;
            }

            let view = self.membership.view();
            if !view.is_alive(&follower) {
                tracing::debug!(
                    "dropping sync session for departed follower {} (partition {})",
                    follower,
                    partition
                );
                return SessionEnd::Done;
            }
            let addr = match view.addr_of(&follower) {
                Some(a) => a,
                None => return SessionEnd::Done,
            };

            let (start, _last, commit, _term) = replica.log_bounds();
            let acked = match self.sessions.lock().unwrap().get(&key) {
                Some(s) => s.acked_offset,
                None => return SessionEnd::Done,
            };
            if acked >= commit {
                return SessionEnd::Done;
            }

            if acked + 1 < start {
                self.set_mode(&key, SyncMode::Snapshot);
                match self.ship_snapshot(&replica, &addr, partition).await {
                    Ok(snapshot_offset) => {
                        self.set_acked(&key, snapshot_offset);
                        self.set_mode(&key, SyncMode::StreamTail);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "snapshot transfer to {} failed (partition {}): {}",
                            follower,
                            partition,
                            e
                        );
                        return SessionEnd::Park;
                    }
                }
            }

            self.set_mode(&key, SyncMode::StreamTail);
            let entries = replica.committed_entries_from(acked + 1, self.cfg.batch_entries);
            if entries.is_empty() {
                return SessionEnd::Done;
            }
            let prev_term = match replica.term_at(acked) {
                Some(t) => t,
                None => return SessionEnd::Park,
            };
            let session_id = match self.sessions.lock().unwrap().get(&key) {
                Some(s) => s.id,
                None => return SessionEnd::Done,
            };
            let batch = TailBatch {
                session: session_id,
                partition,
                prev_term,
                entries,
                commit_offset: commit,
            };
            let deadline = Duration::from_millis(self.cfg.call_timeout_ms);
            match tokio::time::timeout(
                deadline,
                self.transport.call(&addr, PeerMessage::TailEntries(batch)),
            )
            .await
            {
                Ok(Ok(PeerMessage::TailAck { acked_offset, .. })) => {
                    if acked_offset == acked {
                        // follower is not making progress on this path
                        return SessionEnd::Park;
                    }
                    // an ack below the previous point means the follower
                    // truncated a divergent suffix; resume from there
                    self.set_acked(&key, acked_offset);
                }
                Ok(Ok(PeerMessage::Failure(e))) => {
                    tracing::warn!(
                        "tail batch to {} rejected (partition {}): {:?}",
                        follower,
                        partition,
                        e
                    );
                    return SessionEnd::Park;
                }
                _ => return SessionEnd::Park,
            }
        }
    }

    /// Ship a compressed snapshot under the in-flight window; returns the
    /// offset the snapshot covers up to.
    async fn ship_snapshot(
        self: &Arc<Self>,
        replica: &Arc<PartitionReplica>,
        addr: &str,
        partition: u64,
    ) -> Result<u64> {
        // the apply loop may trail the commit point briefly; the snapshot
        // must land inside the retained window for tail shipping to chain
        let mut snap: Option<StorageSnapshot> = None;
        for _ in 0..50 {
            let (start, _, _, _) = replica.log_bounds();
            let s = self.storage.snapshot(partition).await?;
            if s.applied_offset + 1 >= start {
                snap = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snap = snap.ok_or_else(|| {
            Error::Timeout(format!(
                "apply watermark lagging retained log for partition {}",
                partition
            ))
        })?;

        let snapshot_offset = snap.applied_offset;
        let snapshot_term = replica
            .term_at(snapshot_offset)
            .unwrap_or_else(|| replica.log_bounds().3);
        let digest = blake3_hash(&snap.data);
        let compressed = lz4::block::compress(&snap.data, None, true)?;
        let chunks: Vec<Vec<u8>> = if compressed.is_empty() {
            vec![Vec::new()]
        } else {
            compressed
                .chunks(self.cfg.chunk_bytes)
                .map(|c| c.to_vec())
                .collect()
        };
        let total = chunks.len() as u32;
        let session_id = Uuid::new_v4();
        tracing::info!(
            "shipping snapshot of partition {} to {}: {} chunks up to offset {}",
            partition,
            addr,
            total,
            snapshot_offset
        );

        let window = Arc::new(Semaphore::new(self.cfg.window.max(1)));
        let mut tasks = tokio::task::JoinSet::new();
        for (seq, data) in chunks.into_iter().enumerate() {
            let permit = window
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Internal("snapshot window closed".into()))?;
            let msg = PeerMessage::SnapshotChunk(SnapshotChunk {
                session: session_id,
                partition,
                seq: seq as u32,
                total,
                data,
                snapshot_offset,
                snapshot_term,
                digest: if seq as u32 == total - 1 {
                    Some(digest.clone())
                } else {
                    None
                },
            });
            let transport = self.transport.clone();
            let addr = addr.to_string();
            let deadline = Duration::from_millis(self.cfg.call_timeout_ms);
            tasks.spawn(async move {
                let res = tokio::time::timeout(deadline, transport.call(&addr, msg)).await;
                drop(permit);
                match res {
                    Ok(Ok(PeerMessage::SnapshotChunkAck { .. })) => Ok(()),
                    Ok(Ok(PeerMessage::Failure(e))) => Err(crate::Error::from(e)),
                    Ok(Ok(_)) => Err(Error::Internal("unexpected snapshot chunk reply".into())),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(Error::Timeout("snapshot chunk".into())),
                }
            });
        }

        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(Error::Internal(format!("snapshot chunk task: {}", e)));
                }
            }
        }
        Ok(snapshot_offset)
    }

    // === follower side ===

    /// Stage an incoming snapshot chunk; once the set is complete, verify
    /// the digest and restore through the storage engine. A corrupt
    /// stream is discarded entirely and re-requested by the leader.
    pub async fn handle_snapshot_chunk(&self, chunk: SnapshotChunk) -> Result<PeerMessage> {
        let SnapshotChunk {
            session,
            partition,
            seq,
            total,
            data,
            snapshot_offset,
            snapshot_term,
            digest,
        } = chunk;

        let complete = {
            let mut stages = self.stages.lock().unwrap();
            let stage = stages
                .entry(session)
                .or_insert_with(|| SnapStage::new(partition, total, snapshot_offset, snapshot_term));
            stage.chunks.insert(seq, data);
            if digest.is_some() {
                stage.digest = digest;
            }
            stage.complete()
        };

        if complete {
            let stage = self.stages.lock().unwrap().remove(&session).unwrap();
            let mut compressed = Vec::new();
            for (_, piece) in stage.chunks {
                compressed.extend_from_slice(&piece);
            }
            let raw = lz4::block::decompress(&compressed, None)
                .map_err(|e| Error::Corrupt(format!("snapshot decompress: {}", e)))?;
            let expected = stage.digest.as_deref().unwrap_or_default();
            if blake3_hash(&raw) != expected {
                return Err(Error::Corrupt(format!(
                    "snapshot digest mismatch for partition {}",
                    stage.partition
                )));
            }
            self.storage
                .restore(
                    stage.partition,
                    StorageSnapshot {
                        applied_offset: stage.snapshot_offset,
                        data: raw,
                    },
                )
                .await?;
            if let Some(registry) = self.registry.get() {
                if let Some(replica) = registry.get(stage.partition) {
                    replica.reset_for_snapshot(stage.snapshot_offset, stage.snapshot_term)?;
                }
            }
            tracing::info!(
                "restored snapshot of partition {} up to offset {}",
                stage.partition,
                stage.snapshot_offset
            );
        }

        Ok(PeerMessage::SnapshotChunkAck { session, seq })
    }

    /// Apply a tail batch through the local replica.
    pub fn handle_tail(&self, batch: TailBatch) -> Result<PeerMessage> {
        let registry = self
            .registry
            .get()
            .ok_or_else(|| Error::Internal("registry not wired".into()))?;
        let replica = registry
            .get(batch.partition)
            .ok_or_else(|| Error::NotFound(format!("partition {}", batch.partition)))?;
        let acked = replica.accept_tail(batch.prev_term, &batch.entries, batch.commit_offset)?;
        Ok(PeerMessage::TailAck {
            session: batch.session,
            acked_offset: acked,
        })
    }

    // === housekeeping ===

    fn set_mode(&self, key: &(u64, NodeId), mode: SyncMode) {
        if let Some(s) = self.sessions.lock().unwrap().get_mut(key) {
            if s.mode != mode {
                tracing::debug!(
                    "sync session {} for partition {} switching to {}",
                    s.id,
                    key.0,
                    mode
                );
                s.mode = mode;
            }
        }
    }

    fn set_acked(&self, key: &(u64, NodeId), acked: u64) {
        if let Some(s) = self.sessions.lock().unwrap().get_mut(key) {
            s.acked_offset = acked;
            s.touch();
        }
    }

    /// Destroy idle sessions and stale snapshot stages.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let engine = self.clone();
        let idle_ms = self.cfg.session_idle_timeout_ms;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis((idle_ms / 2).max(100)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let now = crate::common::timestamp_now_millis();
                engine.sessions.lock().unwrap().retain(|key, s| {
                    let keep = s.running || s.idle_for(now) < idle_ms;
                    if !keep {
                        tracing::debug!(
                            "destroying idle sync session {} (partition {})",
                            s.id,
                            key.0
                        );
                    }
                    keep
                });
                engine
                    .stages
                    .lock()
                    .unwrap()
                    .retain(|_, stage| now.saturating_sub(stage.created_at) < idle_ms * 4);
            }
        });
    }
}
