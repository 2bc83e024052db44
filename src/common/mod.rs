//! Common utilities and types shared across herd

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

/// Stable node identity used across membership, metadata and replication.
pub type NodeId = String;

pub use config::{
    Config, GatewayConfig, MembershipConfig, MetaConfig, NodeConfig, ReplicationConfig, SeedMember,
    SyncConfig,
};
pub use error::{Error, Result};
pub use hash::{blake3_hash, partition_for, Blake3Hasher};
pub use utils::{
    crc32, decode_key, encode_key, format_bytes, parse_duration, retry_with_backoff, timestamp_now,
    timestamp_now_millis, validate_key,
};
