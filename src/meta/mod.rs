//! Metadata store: versioned partition map behind majority agreement

pub mod failover;
pub mod partition;
pub mod store;

pub use partition::{MetaChange, Partition, PartitionMap};
pub use store::{MetaStore, ReadConsistency};
