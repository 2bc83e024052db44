//! Storage engine collaborator interface
//!
//! The replication coordinator and sync engine are the only callers. Writes
//! carry the log offset that produced them so an engine can discard
//! re-deliveries: an operation at an offset at or below the partition's
//! applied watermark is a no-op.

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// A point-in-time image of a partition's applied state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// Highest log offset applied into this snapshot
    pub applied_offset: u64,
    /// Opaque engine bytes
    pub data: Vec<u8>,
}

/// Narrow local interface to the storage engine.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Apply a write at `offset`. No-op if `offset` is not beyond the
    /// partition's applied watermark.
    async fn put(&self, partition: u64, offset: u64, key: &str, value: Vec<u8>) -> Result<()>;

    /// Apply a delete at `offset`. Same idempotency rule as `put`.
    async fn delete(&self, partition: u64, offset: u64, key: &str) -> Result<()>;

    async fn get(&self, partition: u64, key: &str) -> Result<Option<Vec<u8>>>;

    /// Range scan within one partition: `start` inclusive, `end` exclusive
    /// (empty `end` means unbounded), capped at `limit` entries.
    async fn scan(
        &self,
        partition: u64,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Export the partition's applied state.
    async fn snapshot(&self, partition: u64) -> Result<StorageSnapshot>;

    /// Replace the partition's state with a snapshot; the applied
    /// watermark jumps to the snapshot's offset.
    async fn restore(&self, partition: u64, snapshot: StorageSnapshot) -> Result<()>;

    /// Highest applied log offset for the partition (0 if untouched).
    async fn applied_offset(&self, partition: u64) -> Result<u64>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartitionState {
    applied: u64,
    entries: BTreeMap<String, Vec<u8>>,
}

/// In-memory storage engine used by nodes and tests.
#[derive(Default)]
pub struct MemoryEngine {
    partitions: RwLock<HashMap<u64, PartitionState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn put(&self, partition: u64, offset: u64, key: &str, value: Vec<u8>) -> Result<()> {
        let mut parts = self.partitions.write().unwrap();
        let state = parts.entry(partition).or_default();
        if offset <= state.applied {
            return Ok(());
        }
        state.entries.insert(key.to_string(), value);
        state.applied = offset;
        Ok(())
    }

    async fn delete(&self, partition: u64, offset: u64, key: &str) -> Result<()> {
        let mut parts = self.partitions.write().unwrap();
        let state = parts.entry(partition).or_default();
        if offset <= state.applied {
            return Ok(());
        }
        state.entries.remove(key);
        state.applied = offset;
        Ok(())
    }

    async fn get(&self, partition: u64, key: &str) -> Result<Option<Vec<u8>>> {
        let parts = self.partitions.read().unwrap();
        Ok(parts
            .get(&partition)
            .and_then(|state| state.entries.get(key).cloned()))
    }

    async fn scan(
        &self,
        partition: u64,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let parts = self.partitions.read().unwrap();
        let mut out = Vec::new();
        if let Some(state) = parts.get(&partition) {
            for (k, v) in state.entries.range(start.to_string()..) {
                if !end.is_empty() && k.as_str() >= end {
                    break;
                }
                out.push((k.clone(), v.clone()));
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn snapshot(&self, partition: u64) -> Result<StorageSnapshot> {
        let parts = self.partitions.read().unwrap();
        let (applied, data) = match parts.get(&partition) {
            Some(state) => (
                state.applied,
                bincode::serialize(&state.entries)
                    .map_err(|e| crate::Error::Internal(format!("snapshot encode: {}", e)))?,
            ),
            None => (
                0,
                bincode::serialize(&BTreeMap::<String, Vec<u8>>::new())
                    .map_err(|e| crate::Error::Internal(format!("snapshot encode: {}", e)))?,
            ),
        };
        Ok(StorageSnapshot {
            applied_offset: applied,
            data,
        })
    }

    async fn restore(&self, partition: u64, snapshot: StorageSnapshot) -> Result<()> {
        let entries: BTreeMap<String, Vec<u8>> = bincode::deserialize(&snapshot.data)
            .map_err(|e| crate::Error::Corrupt(format!("snapshot decode: {}", e)))?;
        let mut parts = self.partitions.write().unwrap();
        parts.insert(
            partition,
            PartitionState {
                applied: snapshot.applied_offset,
                entries,
            },
        );
        Ok(())
    }

    async fn applied_offset(&self, partition: u64) -> Result<u64> {
        let parts = self.partitions.read().unwrap();
        Ok(parts.get(&partition).map(|s| s.applied).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let engine = MemoryEngine::new();
        engine.put(0, 1, "k1", b"v1".to_vec()).await.unwrap();
        assert_eq!(engine.get(0, "k1").await.unwrap(), Some(b"v1".to_vec()));

        engine.delete(0, 2, "k1").await.unwrap();
        assert_eq!(engine.get(0, "k1").await.unwrap(), None);
        assert_eq!(engine.applied_offset(0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_offset_ignored() {
        let engine = MemoryEngine::new();
        engine.put(0, 5, "k", b"new".to_vec()).await.unwrap();
        // re-delivery of an older operation must not clobber
        engine.put(0, 3, "k", b"old".to_vec()).await.unwrap();
        assert_eq!(engine.get(0, "k").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_scan_range() {
        let engine = MemoryEngine::new();
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            engine
                .put(0, (i + 1) as u64, k, vec![i as u8])
                .await
                .unwrap();
        }
        let out = engine.scan(0, "b", "d", 10).await.unwrap();
        assert_eq!(
            out.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );

        let capped = engine.scan(0, "", "", 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let engine = MemoryEngine::new();
        engine.put(3, 10, "k1", b"v1".to_vec()).await.unwrap();
        engine.put(3, 11, "k2", b"v2".to_vec()).await.unwrap();

        let snap = engine.snapshot(3).await.unwrap();
        assert_eq!(snap.applied_offset, 11);

        let other = MemoryEngine::new();
        other.restore(3, snap).await.unwrap();
        assert_eq!(other.get(3, "k2").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(other.applied_offset(3).await.unwrap(), 11);
    }
}
