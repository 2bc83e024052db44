//! Catch-up session state

use crate::common::{timestamp_now_millis, NodeId};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Transfer mode for a catch-up session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Bulk transfer of committed state; used when the follower's gap
    /// precedes the leader's retained log
    Snapshot,
    /// Incremental shipping of committed log entries
    StreamTail,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Snapshot => write!(f, "snapshot"),
            SyncMode::StreamTail => write!(f, "stream-tail"),
        }
    }
}

/// Leader-side record of one follower's catch-up progress
#[derive(Debug, Clone, Serialize)]
pub struct SyncSession {
    pub id: Uuid,
    pub partition: u64,
    pub follower: NodeId,
    pub mode: SyncMode,
    /// Last offset the follower has acknowledged
    pub acked_offset: u64,
    /// A task is currently driving this session
    pub running: bool,
    pub last_active: u64,
}

impl SyncSession {
    pub fn new(partition: u64, follower: NodeId, acked_offset: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            partition,
            follower,
            mode: SyncMode::StreamTail,
            acked_offset,
            running: false,
            last_active: timestamp_now_millis(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = timestamp_now_millis();
    }

    pub fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_active)
    }
}

/// Follower-side staging area for an incoming snapshot stream. Chunks
/// arrive in any order inside the window; re-deliveries overwrite
/// identically.
pub struct SnapStage {
    pub partition: u64,
    pub total: u32,
    pub chunks: BTreeMap<u32, Vec<u8>>,
    pub snapshot_offset: u64,
    pub snapshot_term: u64,
    pub digest: Option<String>,
    pub created_at: u64,
}

impl SnapStage {
    pub fn new(partition: u64, total: u32, snapshot_offset: u64, snapshot_term: u64) -> Self {
        Self {
            partition,
            total,
            chunks: BTreeMap::new(),
            snapshot_offset,
            snapshot_term,
            digest: None,
            created_at: timestamp_now_millis(),
        }
    }

    pub fn complete(&self) -> bool {
        self.digest.is_some() && self.chunks.len() as u32 == self.total
    }
}
