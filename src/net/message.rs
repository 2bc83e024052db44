//! Wire protocol types for inter-node communication
//!
//! Everything a node says to a peer is one tagged `PeerMessage`; the
//! transport layer frames and checksums it. Requests and responses share
//! the enum, and errors cross the wire as `Failure`.

use crate::common::NodeId;
use crate::membership::member::MemberUpdate;
use crate::meta::partition::{MetaChange, PartitionMap};
use crate::repl::log::LogEntry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tagged envelope for the peer wire protocol (bincode encoded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    // === membership ===
    Ping {
        from: NodeId,
        seq: u64,
        updates: Vec<MemberUpdate>,
    },
    PingReq {
        from: NodeId,
        seq: u64,
        target: NodeId,
        target_addr: String,
        updates: Vec<MemberUpdate>,
    },
    Ack {
        from: NodeId,
        seq: u64,
        updates: Vec<MemberUpdate>,
    },
    Join {
        from: NodeId,
        addr: String,
        incarnation: u64,
    },
    JoinAck {
        members: Vec<MemberUpdate>,
    },
    Leave {
        from: NodeId,
        incarnation: u64,
    },
    LeaveAck,

    // === metadata ===
    MetaPropose {
        from: NodeId,
        epoch: u64,
        change: MetaChange,
    },
    MetaGrant {
        from: NodeId,
        epoch: u64,
        granted: bool,
        committed_epoch: u64,
    },
    MetaCommit {
        from: NodeId,
        epoch: u64,
        map: PartitionMap,
    },
    MetaCommitAck {
        committed_epoch: u64,
    },
    MetaRead,
    MetaMap {
        map: PartitionMap,
    },
    LogStatus {
        partition: u64,
    },
    LogStatusAck {
        partition: u64,
        term: u64,
        last_offset: u64,
    },

    // === replication ===
    Append(AppendRequest),
    AppendAck(AppendResponse),
    CommitNotice {
        partition: u64,
        term: u64,
        commit_offset: u64,
    },
    CommitNoticeAck,

    // === sync / catch-up ===
    SyncRequest {
        partition: u64,
        follower: NodeId,
        last_offset: u64,
    },
    SyncAck,
    SnapshotChunk(SnapshotChunk),
    SnapshotChunkAck {
        session: Uuid,
        seq: u32,
    },
    TailEntries(TailBatch),
    TailAck {
        session: Uuid,
        acked_offset: u64,
    },

    // === client operations forwarded by the gateway ===
    ClientOp {
        partition: u64,
        op: ClientOp,
    },
    ClientOpResult(OpResult),

    // === errors ===
    Failure(WireError),
}

/// Leader-to-follower replication batch. An empty `entries` vector is a
/// heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub partition: u64,
    pub term: u64,
    pub leader: NodeId,
    pub prev_offset: u64,
    pub prev_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub partition: u64,
    pub from: NodeId,
    pub term: u64,
    pub success: bool,
    /// Cumulative acknowledgment: everything up to here is stored
    pub last_offset: u64,
    /// On failure, where the leader should resend from (0 = none)
    pub conflict_offset: u64,
}

/// One windowed piece of a compressed snapshot stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub session: Uuid,
    pub partition: u64,
    pub seq: u32,
    pub total: u32,
    pub data: Vec<u8>,
    /// Log offset the snapshot covers up to
    pub snapshot_offset: u64,
    /// Term of the entry at `snapshot_offset`
    pub snapshot_term: u64,
    /// blake3 of the uncompressed stream, sent on the final chunk
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailBatch {
    pub session: Uuid,
    pub partition: u64,
    /// Term of the entry directly below `entries[0]` on the leader
    pub prev_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_offset: u64,
}

/// Client operation routed to a partition leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientOp {
    Put { key: String, value: Vec<u8> },
    Get { key: String },
    Delete { key: String },
    Scan { start: String, end: String, limit: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpResult {
    /// A write committed at this offset
    Done { offset: u64 },
    Value { value: Option<Vec<u8>> },
    Range { entries: Vec<(String, Vec<u8>)> },
}

/// Serializable mirror of the crate error taxonomy for wire transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireError {
    NotLeader {
        partition: u64,
        leader: Option<NodeId>,
    },
    NoQuorum(String),
    TermMismatch {
        partition: u64,
        local: u64,
        remote: u64,
    },
    EpochStale {
        seen: u64,
        got: u64,
    },
    Timeout(String),
    NodeUnreachable(String),
    Corrupt(String),
    NotFound(String),
    Internal(String),
}

impl From<&crate::Error> for WireError {
    fn from(e: &crate::Error) -> Self {
        match e {
            crate::Error::NotLeader { partition, leader } => WireError::NotLeader {
                partition: *partition,
                leader: leader.clone(),
            },
            crate::Error::NoQuorum(s) => WireError::NoQuorum(s.clone()),
            crate::Error::TermMismatch {
                partition,
                local,
                remote,
            } => WireError::TermMismatch {
                partition: *partition,
                local: *local,
                remote: *remote,
            },
            crate::Error::EpochStale { seen, got } => WireError::EpochStale {
                seen: *seen,
                got: *got,
            },
            crate::Error::Timeout(s) => WireError::Timeout(s.clone()),
            crate::Error::NodeUnreachable(s) => WireError::NodeUnreachable(s.clone()),
            crate::Error::Corrupt(s) => WireError::Corrupt(s.clone()),
            crate::Error::NotFound(s) => WireError::NotFound(s.clone()),
            other => WireError::Internal(other.to_string()),
        }
    }
}

impl From<WireError> for crate::Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::NotLeader { partition, leader } => {
                crate::Error::NotLeader { partition, leader }
            }
            WireError::NoQuorum(s) => crate::Error::NoQuorum(s),
            WireError::TermMismatch {
                partition,
                local,
                remote,
            } => crate::Error::TermMismatch {
                partition,
                local,
                remote,
            },
            WireError::EpochStale { seen, got } => crate::Error::EpochStale { seen, got },
            WireError::Timeout(s) => crate::Error::Timeout(s),
            WireError::NodeUnreachable(s) => crate::Error::NodeUnreachable(s),
            WireError::Corrupt(s) => crate::Error::Corrupt(s),
            WireError::NotFound(s) => crate::Error::NotFound(s),
            WireError::Internal(s) => crate::Error::Internal(s),
        }
    }
}

impl PeerMessage {
    /// Wrap an error for the response path
    pub fn failure(e: &crate::Error) -> Self {
        PeerMessage::Failure(WireError::from(e))
    }
}
