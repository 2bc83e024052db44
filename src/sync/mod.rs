//! Sync engine: snapshot and incremental catch-up for lagging replicas

pub mod engine;
pub mod session;

pub use engine::SyncEngine;
pub use session::{SyncMode, SyncSession};
