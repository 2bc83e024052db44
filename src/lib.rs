//! # herd
//!
//! A cluster coordination and replication layer in front of a storage
//! engine:
//! - SWIM-style gossip membership with incarnation-based refutation
//! - strongly-ordered partition metadata behind majority agreement
//! - per-partition leader replication with quorum commits
//! - snapshot / stream-tail catch-up for lagging replicas
//! - a stateless gateway routing client operations to partition leaders
//!
//! ## Architecture
//!
//! ```text
//!            ┌───────────────────────────────┐
//!            │          Gateway (HTTP)       │
//!            │  route by key → partition map │
//!            └──────────────┬────────────────┘
//!                           │ peer wire protocol
//!          ┌────────────────┼────────────────┐
//!          │                │                │
//!   ┌──────▼──────┐  ┌──────▼──────┐  ┌──────▼──────┐
//!   │   Node A    │  │   Node B    │  │   Node C    │
//!   │ leader p0   │  │ leader p1   │  │ leader p2   │
//!   │ follower p1 │  │ follower p2 │  │ follower p0 │
//!   │  + log      │  │  + log      │  │  + log      │
//!   └─────────────┘  └─────────────┘  └─────────────┘
//!      membership gossip + metadata quorum, all-to-all
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! herd-node serve \
//!   --id node-1 \
//!   --peer 0.0.0.0:7001 \
//!   --http 0.0.0.0:8001 \
//!   --data ./node1-data \
//!   --members node-1@host1:7001,node-2@host2:7001,node-3@host3:7001
//! ```
//!
//! ### Use the CLI
//! ```bash
//! herd put my-key --value "hello" --gateway http://localhost:8001
//! herd get my-key
//! herd scan --start a --end z
//! herd status
//! ```

pub mod common;
pub mod gateway;
pub mod membership;
pub mod meta;
pub mod net;
pub mod repl;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use server::Node;
pub use storage::{MemoryEngine, StorageEngine};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
