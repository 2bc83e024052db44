//! Configuration for herd nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity, addresses and bootstrap seeds
    #[serde(default)]
    pub node: NodeConfig,

    /// Failure detector tuning
    #[serde(default)]
    pub membership: MembershipConfig,

    /// Metadata store tuning
    #[serde(default)]
    pub meta: MetaConfig,

    /// Replication coordinator tuning
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Sync engine tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Gateway tuning
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            membership: MembershipConfig::default(),
            meta: MetaConfig::default(),
            replication: ReplicationConfig::default(),
            sync: SyncConfig::default(),
            gateway: GatewayConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// An entry of the bootstrap seed list: node id plus peer address.
///
/// The initial members double as the metadata-store voter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedMember {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID (unique identifier)
    pub node_id: String,

    /// Bind address for the peer wire protocol
    pub peer_addr: SocketAddr,

    /// Address other nodes reach us at; defaults to `peer_addr`.
    /// Needed behind NAT and by the in-memory transport in tests.
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Bind address for the client HTTP API
    pub http_addr: SocketAddr,

    /// Directory for persisted state (partition map, partition logs).
    /// `None` keeps everything in memory (tests).
    pub data_dir: Option<PathBuf>,

    /// Bootstrap seed list; used only to join the gossip ring at start
    /// and as the fixed metadata voter set.
    #[serde(default)]
    pub initial_members: Vec<SeedMember>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            peer_addr: "0.0.0.0:7000".parse().unwrap(),
            advertise_addr: None,
            http_addr: "0.0.0.0:8000".parse().unwrap(),
            data_dir: Some(PathBuf::from("./herd-data")),
            initial_members: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// The peer address announced to the cluster.
    pub fn advertised_peer_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.peer_addr.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Interval between direct probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Timeout for a single probe round-trip
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// How many members relay an indirect probe before suspecting
    #[serde(default = "default_indirect_probes")]
    pub indirect_probes: usize,

    /// How long a member stays Suspect before converting to Dead
    #[serde(default = "default_suspicion_timeout")]
    pub suspicion_timeout_ms: u64,

    /// Retransmit budget multiplier; each update is piggybacked
    /// `retransmit_factor * ceil(log2(n+1))` times
    #[serde(default = "default_retransmit_factor")]
    pub retransmit_factor: u32,

    /// Max piggybacked updates per probe message
    #[serde(default = "default_piggyback_max")]
    pub piggyback_max: usize,
}

fn default_probe_interval() -> u64 {
    1000
}
fn default_probe_timeout() -> u64 {
    500
}
fn default_indirect_probes() -> usize {
    3
}
fn default_suspicion_timeout() -> u64 {
    5000
}
fn default_retransmit_factor() -> u32 {
    3
}
fn default_piggyback_max() -> usize {
    6
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            indirect_probes: default_indirect_probes(),
            suspicion_timeout_ms: default_suspicion_timeout(),
            retransmit_factor: default_retransmit_factor(),
            piggyback_max: default_piggyback_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Timeout for collecting proposal grants
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_ms: u64,

    /// Interval for the background partition-map refresh
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

fn default_proposal_timeout() -> u64 {
    2000
}
fn default_refresh_interval() -> u64 {
    2000
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            proposal_timeout_ms: default_proposal_timeout(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of partitions in the initial map
    #[serde(default = "default_num_partitions")]
    pub num_partitions: u64,

    /// Replicas per partition
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Timeout for the append quorum wait
    #[serde(default = "default_append_timeout")]
    pub append_timeout_ms: u64,

    /// Leader heartbeat interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Committed entries retained in the in-memory log window; a
    /// follower further behind than this is served a snapshot
    #[serde(default = "default_retained_entries")]
    pub retained_entries: usize,
}

fn default_num_partitions() -> u64 {
    16
}
fn default_replication_factor() -> usize {
    3
}
fn default_append_timeout() -> u64 {
    2000
}
fn default_heartbeat_interval() -> u64 {
    500
}
fn default_retained_entries() -> usize {
    4096
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            num_partitions: default_num_partitions(),
            replication_factor: default_replication_factor(),
            append_timeout_ms: default_append_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            retained_entries: default_retained_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Max in-flight snapshot chunks per session
    #[serde(default = "default_window")]
    pub window: usize,

    /// Snapshot chunk size in bytes (after compression)
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,

    /// Max entries per tail batch
    #[serde(default = "default_batch_entries")]
    pub batch_entries: usize,

    /// Timeout for a single chunk or batch round-trip
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Idle sessions are destroyed after this long
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_ms: u64,
}

fn default_window() -> usize {
    32
}
fn default_chunk_bytes() -> usize {
    64 * 1024
}
fn default_batch_entries() -> usize {
    64
}
fn default_call_timeout() -> u64 {
    2000
}
fn default_session_idle_timeout() -> u64 {
    30_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            chunk_bytes: default_chunk_bytes(),
            batch_entries: default_batch_entries(),
            call_timeout_ms: default_call_timeout(),
            session_idle_timeout_ms: default_session_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-request timeout when forwarding to a partition leader
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Default scan result cap
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,

    /// Max accepted value size
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,
}

fn default_request_timeout() -> u64 {
    5000
}
fn default_scan_limit() -> usize {
    1000
}
fn default_max_value_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            scan_limit: default_scan_limit(),
            max_value_bytes: default_max_value_bytes(),
        }
    }
}

impl Config {
    /// Load config from `herd.toml` (optional) and `HERD_*` environment
    /// variables, falling back to defaults. CLI flags override on top.
    pub fn load() -> Self {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("herd").required(false))
            .add_source(config::Environment::with_prefix("HERD").separator("__"));

        match builder.build().and_then(|c| c.try_deserialize()) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::debug!("no config file loaded ({}), using defaults", e);
                Config::default()
            }
        }
    }

    /// Quorum size for the metadata voter set
    pub fn meta_majority(&self) -> usize {
        self.node.initial_members.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.replication.replication_factor, 3);
        assert_eq!(cfg.replication.num_partitions, 16);
        assert_eq!(cfg.membership.probe_interval_ms, 1000);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_meta_majority() {
        let mut cfg = Config::default();
        cfg.node.initial_members = (1..=5)
            .map(|i| SeedMember {
                id: format!("node-{}", i),
                addr: format!("127.0.0.1:700{}", i),
            })
            .collect();
        assert_eq!(cfg.meta_majority(), 3);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut cfg = Config::default();
        cfg.node.node_id = "node-7".to_string();
        let encoded = serde_json::to_string(&cfg).unwrap();
        let decoded: Config = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.node.node_id, "node-7");
        assert_eq!(
            decoded.replication.retained_entries,
            cfg.replication.retained_entries
        );
    }
}
