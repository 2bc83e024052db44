//! Request routing to partition leaders
//!
//! Stateless: consults the metadata store's local (stale) snapshot,
//! forwards to the named leader, and on a retryable failure refreshes
//! through a linearizable read and retries exactly once before
//! surfacing the error.

use crate::common::{partition_for, Error, GatewayConfig, Result};
use crate::membership::Membership;
use crate::meta::partition::PartitionMap;
use crate::meta::store::{MetaStore, ReadConsistency};
use crate::net::message::{ClientOp, OpResult, PeerMessage};
use crate::net::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

pub struct Router {
    meta: Arc<MetaStore>,
    transport: Arc<dyn Transport>,
    membership: Membership,
    cfg: GatewayConfig,
}

impl Router {
    pub fn new(
        meta: Arc<MetaStore>,
        transport: Arc<dyn Transport>,
        membership: Membership,
        cfg: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            transport,
            membership,
            cfg,
        })
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let op = ClientOp::Put {
            key: key.to_string(),
            value,
        };
        match self.route_key_op(key, op).await? {
            OpResult::Done { offset } => Ok(offset),
            other => Err(Error::Internal(format!("unexpected result: {:?}", other))),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let op = ClientOp::Get {
            key: key.to_string(),
        };
        match self.route_key_op(key, op).await? {
            OpResult::Value { value } => Ok(value),
            other => Err(Error::Internal(format!("unexpected result: {:?}", other))),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<u64> {
        let op = ClientOp::Delete {
            key: key.to_string(),
        };
        match self.route_key_op(key, op).await? {
            OpResult::Done { offset } => Ok(offset),
            other => Err(Error::Internal(format!("unexpected result: {:?}", other))),
        }
    }

    /// Range scan. Keys are hash-partitioned, so the range fans out to
    /// every partition leader and the results are merged.
    pub async fn scan(
        &self,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let limit = if limit == 0 { self.cfg.scan_limit } else { limit };
        let map = self.meta.read_stale();
        match self.scan_once(&map, start, end, limit).await {
            Ok(entries) => Ok(entries),
            Err(e) if e.is_retryable() => {
                tracing::debug!("scan retry after {}", e);
                let map = self.meta.read_snapshot(ReadConsistency::Linearizable).await?;
                self.scan_once(&map, start, end, limit).await
            }
            Err(e) => Err(e),
        }
    }

    async fn scan_once(
        &self,
        map: &PartitionMap,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        if map.num_partitions() == 0 {
            return Err(Error::NoQuorum("partition map not initialized".into()));
        }
        let calls = map.partitions.keys().map(|id| {
            let op = ClientOp::Scan {
                start: start.to_string(),
                end: end.to_string(),
                limit,
            };
            self.call_partition(map, *id, op)
        });
        let mut merged = Vec::new();
        for res in futures_util::future::join_all(calls).await {
            match res? {
                OpResult::Range { entries } => merged.extend(entries),
                other => {
                    return Err(Error::Internal(format!("unexpected result: {:?}", other)))
                }
            }
        }
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        merged.truncate(limit);
        Ok(merged)
    }

    async fn route_key_op(&self, key: &str, op: ClientOp) -> Result<OpResult> {
        let map = self.meta.read_stale();
        match self.try_key_op(&map, key, op.clone()).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_retryable() => {
                tracing::debug!("re-routing {} after {}", key, e);
                let map = self.meta.read_snapshot(ReadConsistency::Linearizable).await?;
                self.try_key_op(&map, key, op).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_key_op(&self, map: &PartitionMap, key: &str, op: ClientOp) -> Result<OpResult> {
        if map.num_partitions() == 0 {
            return Err(Error::NoQuorum("partition map not initialized".into()));
        }
        let partition = partition_for(key, map.num_partitions());
        self.call_partition(map, partition, op).await
    }

    async fn call_partition(
        &self,
        map: &PartitionMap,
        partition: u64,
        op: ClientOp,
    ) -> Result<OpResult> {
        let p = map
            .partition(partition)
            .ok_or_else(|| Error::Internal(format!("partition {} missing from map", partition)))?;
        let addr = self.addr_of(&p.leader).ok_or_else(|| {
            Error::NodeUnreachable(format!("no address for leader {}", p.leader))
        })?;

        let deadline = Duration::from_millis(self.cfg.request_timeout_ms);
        let msg = PeerMessage::ClientOp { partition, op };
        match tokio::time::timeout(deadline, self.transport.call(&addr, msg)).await {
            Ok(Ok(PeerMessage::ClientOpResult(result))) => Ok(result),
            Ok(Ok(PeerMessage::Failure(e))) => Err(e.into()),
            Ok(Ok(other)) => Err(Error::Internal(format!(
                "unexpected reply from {}: {:?}",
                p.leader, other
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(format!(
                "request to leader {} of partition {}",
                p.leader, partition
            ))),
        }
    }

    fn addr_of(&self, node: &str) -> Option<String> {
        self.membership.view().addr_of(node).or_else(|| {
            self.meta
                .voters()
                .iter()
                .find(|v| v.id == node)
                .map(|v| v.addr.clone())
        })
    }
}
