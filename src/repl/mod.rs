//! Replication coordinator: per-partition leader logic and logs

pub mod coordinator;
pub mod log;

pub use coordinator::{PartitionReplica, ReplicaRegistry, ReplicaRole, WriteOp};
pub use log::{AppendOutcome, LogEntry, ReplicationLog};
