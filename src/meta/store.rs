//! Quorum-backed metadata store
//!
//! Single source of truth for the partition map. Mutations go through a
//! single-round propose / majority-grant / commit protocol over the
//! fixed voter set (the bootstrap members). Exactly one proposal wins a
//! given epoch: an acceptor grants epoch `e` only when `e` is the direct
//! successor of its committed epoch and `e` is not promised to another
//! proposer. Promises expire so a crashed proposer cannot wedge the
//! epoch; commits are only honored from the current promise holder.
//!
//! Losing a majority of voters makes the store read-only: proposals fail
//! with `NoQuorum` while stale snapshots keep being served.

use crate::common::{
    crc32, timestamp_now_millis, Error, MetaConfig, NodeId, Result, SeedMember,
};
use crate::meta::partition::{MetaChange, PartitionMap};
use crate::net::message::PeerMessage;
use crate::net::transport::Transport;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

const META_MAGIC: [u8; 4] = [0x48, 0x4D, 0x4D, 0x31]; // "HMM1"

/// Read consistency for `read_snapshot`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Contact a majority of voters, return the latest committed epoch
    Linearizable,
    /// Return the local cache immediately, annotated with its epoch
    Stale,
}

struct MetaState {
    committed: PartitionMap,
    promised_epoch: u64,
    promised_to: NodeId,
    promised_at: u64,
}

pub struct MetaStore {
    node_id: NodeId,
    voters: Vec<SeedMember>,
    cfg: MetaConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<MetaState>,
    map_tx: watch::Sender<PartitionMap>,
    path: Option<PathBuf>,
}

impl MetaStore {
    pub fn new(
        node_id: NodeId,
        voters: Vec<SeedMember>,
        cfg: MetaConfig,
        transport: Arc<dyn Transport>,
        data_dir: Option<&Path>,
    ) -> Result<Arc<Self>> {
        let path = data_dir.map(|d| d.join("meta.bin"));
        let committed = match &path {
            Some(p) => Self::load(p)?.unwrap_or_default(),
            None => PartitionMap::default(),
        };
        if committed.epoch > 0 {
            tracing::info!(
                "loaded partition map at epoch {} ({} partitions)",
                committed.epoch,
                committed.num_partitions()
            );
        }
        let (map_tx, _) = watch::channel(committed.clone());
        Ok(Arc::new(Self {
            node_id,
            voters,
            cfg,
            transport,
            state: Mutex::new(MetaState {
                committed,
                promised_epoch: 0,
                promised_to: String::new(),
                promised_at: 0,
            }),
            map_tx,
            path,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn voters(&self) -> &[SeedMember] {
        &self.voters
    }

    pub fn is_voter(&self) -> bool {
        self.voters.iter().any(|v| v.id == self.node_id)
    }

    fn majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().unwrap().committed.epoch
    }

    pub fn map_watch(&self) -> watch::Receiver<PartitionMap> {
        self.map_tx.subscribe()
    }

    /// Read the partition map at the requested consistency.
    pub async fn read_snapshot(&self, consistency: ReadConsistency) -> Result<PartitionMap> {
        match consistency {
            ReadConsistency::Stale => Ok(self.read_stale()),
            ReadConsistency::Linearizable => self.read_linearizable().await,
        }
    }

    /// Local committed map, annotated with its epoch. Never blocks.
    pub fn read_stale(&self) -> PartitionMap {
        self.state.lock().unwrap().committed.clone()
    }

    async fn read_linearizable(&self) -> Result<PartitionMap> {
        let mut responses = 1usize; // ourselves
        let mut best = self.read_stale();

        let timeout = Duration::from_millis(self.cfg.proposal_timeout_ms);
        let calls = self
            .voters
            .iter()
            .filter(|v| v.id != self.node_id)
            .map(|v| {
                let transport = self.transport.clone();
                let addr = v.addr.clone();
                async move { tokio::time::timeout(timeout, transport.call(&addr, PeerMessage::MetaRead)).await }
            });
        for res in futures_util::future::join_all(calls).await {
            if let Ok(Ok(PeerMessage::MetaMap { map })) = res {
                responses += 1;
                if map.epoch > best.epoch {
                    best = map;
                }
            }
        }

        if responses < self.majority() {
            return Err(Error::NoQuorum(format!(
                "linearizable read reached {}/{} voters",
                responses,
                self.voters.len()
            )));
        }
        self.adopt(best.clone());
        Ok(best)
    }

    /// Submit a metadata mutation. Returns the committed map on success.
    pub async fn propose(&self, change: MetaChange) -> Result<PartitionMap> {
        let timeout = Duration::from_millis(self.cfg.proposal_timeout_ms);
        let now = timestamp_now_millis();

        // self-grant under the same rule remote voters apply
        let (target, base) = {
            let mut s = self.state.lock().unwrap();
            let target = s.committed.epoch + 1;
            let expired =
                now.saturating_sub(s.promised_at) > 2 * self.cfg.proposal_timeout_ms;
            if s.promised_epoch >= target && s.promised_to != self.node_id && !expired {
                return Err(Error::NoQuorum(format!(
                    "epoch {} already promised to {}",
                    target, s.promised_to
                )));
            }
            s.promised_epoch = target;
            s.promised_to = self.node_id.clone();
            s.promised_at = now;
            (target, s.committed.clone())
        };

        let mut granted = 1usize; // our own grant
        let mut max_committed = base.epoch;

        let calls = self
            .voters
            .iter()
            .filter(|v| v.id != self.node_id)
            .map(|v| {
                let transport = self.transport.clone();
                let addr = v.addr.clone();
                let msg = PeerMessage::MetaPropose {
                    from: self.node_id.clone(),
                    epoch: target,
                    change: change.clone(),
                };
                async move { tokio::time::timeout(timeout, transport.call(&addr, msg)).await }
            });
        for res in futures_util::future::join_all(calls).await {
            if let Ok(Ok(PeerMessage::MetaGrant {
                granted: g,
                committed_epoch,
                ..
            })) = res
            {
                if g {
                    granted += 1;
                }
                max_committed = max_committed.max(committed_epoch);
            }
        }

        if max_committed > base.epoch {
            return Err(Error::EpochStale {
                seen: base.epoch,
                got: max_committed,
            });
        }
        if granted < self.majority() {
            return Err(Error::NoQuorum(format!(
                "proposal for epoch {} got {}/{} grants",
                target,
                granted,
                self.voters.len()
            )));
        }

        let mut new_map = base;
        new_map.apply(&change)?;
        new_map.epoch = target;

        // broadcast before adopting locally; a voter that stores the
        // commit pins the epoch even if we crash mid-way
        for v in self.voters.iter().filter(|v| v.id != self.node_id) {
            let transport = self.transport.clone();
            let addr = v.addr.clone();
            let msg = PeerMessage::MetaCommit {
                from: self.node_id.clone(),
                epoch: target,
                map: new_map.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = transport.call(&addr, msg).await {
                    tracing::debug!("commit notice to {} failed: {}", addr, e);
                }
            });
        }

        {
            let mut s = self.state.lock().unwrap();
            if s.committed.epoch >= target {
                return Err(Error::EpochStale {
                    seen: s.committed.epoch,
                    got: target,
                });
            }
            if s.promised_epoch == target && s.promised_to != self.node_id {
                return Err(Error::NoQuorum(
                    "proposal superseded during commit".into(),
                ));
            }
            s.committed = new_map.clone();
            self.persist(&s.committed)?;
        }
        self.map_tx.send_replace(new_map.clone());
        tracing::info!("committed metadata epoch {}", target);
        Ok(new_map)
    }

    /// Adopt a higher-epoch committed map (from reads or commits).
    fn adopt(&self, map: PartitionMap) {
        let adopted = {
            let mut s = self.state.lock().unwrap();
            if map.epoch <= s.committed.epoch {
                false
            } else {
                s.committed = map.clone();
                if let Err(e) = self.persist(&s.committed) {
                    tracing::error!("failed to persist partition map: {}", e);
                }
                true
            }
        };
        if adopted {
            tracing::debug!("adopted partition map at epoch {}", map.epoch);
            self.map_tx.send_replace(map);
        }
    }

    // === voter-side message handlers ===

    pub fn handle_propose(&self, from: NodeId, epoch: u64, _change: &MetaChange) -> PeerMessage {
        let now = timestamp_now_millis();
        let mut s = self.state.lock().unwrap();
        let expired = now.saturating_sub(s.promised_at) > 2 * self.cfg.proposal_timeout_ms;
        let granted = epoch == s.committed.epoch + 1
            && (s.promised_epoch < epoch || expired || s.promised_to == from);
        if granted {
            s.promised_epoch = epoch;
            s.promised_to = from.clone();
            s.promised_at = now;
        }
        PeerMessage::MetaGrant {
            from: self.node_id.clone(),
            epoch,
            granted,
            committed_epoch: s.committed.epoch,
        }
    }

    pub fn handle_commit(&self, from: NodeId, epoch: u64, map: PartitionMap) -> PeerMessage {
        let now = timestamp_now_millis();
        let (adopted, committed_epoch) = {
            let mut s = self.state.lock().unwrap();
            let expired = now.saturating_sub(s.promised_at) > 2 * self.cfg.proposal_timeout_ms;
            let stale_proposer = epoch == s.promised_epoch && s.promised_to != from && !expired;
            if epoch > s.committed.epoch && !stale_proposer {
                s.committed = map.clone();
                if let Err(e) = self.persist(&s.committed) {
                    tracing::error!("failed to persist partition map: {}", e);
                }
                (true, s.committed.epoch)
            } else {
                (false, s.committed.epoch)
            }
        };
        if adopted {
            self.map_tx.send_replace(map);
        }
        PeerMessage::MetaCommitAck { committed_epoch }
    }

    pub fn handle_read(&self) -> PeerMessage {
        PeerMessage::MetaMap {
            map: self.read_stale(),
        }
    }

    // === persistence ===

    fn persist(&self, map: &PartitionMap) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = bincode::serialize(map)
            .map_err(|e| Error::Internal(format!("encode partition map: {}", e)))?;
        let mut bytes = Vec::with_capacity(body.len() + 12);
        bytes.extend_from_slice(&META_MAGIC);
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&crc32(&body).to_le_bytes());

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn load(path: &Path) -> Result<Option<PartitionMap>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 12 || bytes[0..4] != META_MAGIC {
            return Err(Error::Corrupt("partition map file header".into()));
        }
        let len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        if bytes.len() != len + 12 {
            return Err(Error::Corrupt("partition map file length".into()));
        }
        let body = &bytes[8..8 + len];
        let stored = u32::from_le_bytes(bytes[8 + len..12 + len].try_into().unwrap());
        if crc32(body) != stored {
            return Err(Error::Corrupt("partition map file checksum".into()));
        }
        let map = bincode::deserialize(body)
            .map_err(|e| Error::Corrupt(format!("partition map decode: {}", e)))?;
        Ok(Some(map))
    }

    /// Background anti-entropy: periodically pull the highest committed
    /// epoch from other voters so non-proposing nodes converge.
    pub fn spawn_refresh(self: &Arc<Self>) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                store.cfg.refresh_interval_ms,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let local_epoch = store.epoch();
                for v in store.voters.iter().filter(|v| v.id != store.node_id) {
                    match store.transport.call(&v.addr, PeerMessage::MetaRead).await {
                        Ok(PeerMessage::MetaMap { map }) if map.epoch > local_epoch => {
                            store.adopt(map);
                            break;
                        }
                        _ => {}
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::partition::Partition;
    use crate::net::mem::MemNet;
    use tempfile::tempdir;

    fn seed(id: &str) -> SeedMember {
        SeedMember {
            id: id.to_string(),
            addr: format!("mem://{}", id),
        }
    }

    fn store_for(id: &str, voters: Vec<SeedMember>, net: &MemNet) -> Arc<MetaStore> {
        MetaStore::new(
            id.to_string(),
            voters,
            MetaConfig::default(),
            Arc::new(net.transport(&format!("mem://{}", id))),
            None,
        )
        .unwrap()
    }

    fn init_change() -> MetaChange {
        MetaChange::InitMap {
            partitions: vec![Partition {
                id: 0,
                replicas: vec!["a".into(), "b".into(), "c".into()],
                leader: "a".into(),
                term: 1,
            }],
        }
    }

    #[test]
    fn test_grant_rule_successor_epoch_only() {
        let net = MemNet::new();
        let voters = vec![seed("a"), seed("b"), seed("c")];
        let store = store_for("a", voters, &net);

        // epoch 2 is not the successor of committed epoch 0
        match store.handle_propose("b".into(), 2, &init_change()) {
            PeerMessage::MetaGrant { granted, .. } => assert!(!granted),
            other => panic!("unexpected: {:?}", other),
        }
        match store.handle_propose("b".into(), 1, &init_change()) {
            PeerMessage::MetaGrant { granted, .. } => assert!(granted),
            other => panic!("unexpected: {:?}", other),
        }
        // epoch 1 is now promised to b; c is refused
        match store.handle_propose("c".into(), 1, &init_change()) {
            PeerMessage::MetaGrant { granted, .. } => assert!(!granted),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_commit_only_from_promise_holder() {
        let net = MemNet::new();
        let voters = vec![seed("a"), seed("b"), seed("c")];
        let store = store_for("a", voters, &net);

        store.handle_propose("b".into(), 1, &init_change());

        let mut map = PartitionMap::default();
        map.apply(&init_change()).unwrap();
        map.epoch = 1;

        // c never got the promise; its commit for epoch 1 is refused
        store.handle_commit("c".into(), 1, map.clone());
        assert_eq!(store.epoch(), 0);

        store.handle_commit("b".into(), 1, map);
        assert_eq!(store.epoch(), 1);
    }

    #[test]
    fn test_epoch_never_goes_backwards() {
        let net = MemNet::new();
        let voters = vec![seed("a"), seed("b"), seed("c")];
        let store = store_for("a", voters, &net);

        let mut map = PartitionMap::default();
        map.apply(&init_change()).unwrap();
        map.epoch = 5;
        store.adopt(map.clone());
        assert_eq!(store.epoch(), 5);

        let mut older = map;
        older.epoch = 3;
        store.adopt(older);
        assert_eq!(store.epoch(), 5);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let net = MemNet::new();
        let voters = vec![seed("a")];

        {
            let store = MetaStore::new(
                "a".to_string(),
                voters.clone(),
                MetaConfig::default(),
                Arc::new(net.transport("mem://a")),
                Some(dir.path()),
            )
            .unwrap();
            let mut map = PartitionMap::default();
            map.apply(&init_change()).unwrap();
            map.epoch = 7;
            store.adopt(map);
        }

        let store = MetaStore::new(
            "a".to_string(),
            voters,
            MetaConfig::default(),
            Arc::new(net.transport("mem://a")),
            Some(dir.path()),
        )
        .unwrap();
        assert_eq!(store.epoch(), 7);
        assert_eq!(store.read_stale().num_partitions(), 1);
    }
}
