//! Node server: wires membership, metadata, replication, sync and the
//! gateway together and dispatches the peer wire protocol.

use crate::common::{timestamp_now, Config, Error, Result};
use crate::gateway::http::{create_router, GatewayState};
use crate::gateway::router::Router;
use crate::membership::member::MembershipEvent;
use crate::membership::Membership;
use crate::meta::failover::run_failover;
use crate::meta::partition::{MetaChange, Partition};
use crate::meta::store::MetaStore;
use crate::net::message::PeerMessage;
use crate::net::transport::{serve_peer, PeerHandler, Transport};
use crate::repl::coordinator::ReplicaRegistry;
use crate::storage::StorageEngine;
use crate::sync::SyncEngine;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Node {
    config: Config,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn StorageEngine>,
    membership: Membership,
    meta: Arc<MetaStore>,
    registry: Arc<ReplicaRegistry>,
    sync: Arc<SyncEngine>,
    router: Arc<Router>,
    started_at: u64,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MembershipEvent>>>,
}

impl Node {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StorageEngine>,
    ) -> Result<Arc<Self>> {
        let node_id = config.node.node_id.clone();
        let local_addr = config.node.advertised_peer_addr();

        let (membership, events_rx) = Membership::spawn(
            config.membership.clone(),
            node_id.clone(),
            local_addr,
            transport.clone(),
        );

        let meta = MetaStore::new(
            node_id.clone(),
            config.node.initial_members.clone(),
            config.meta.clone(),
            transport.clone(),
            config.node.data_dir.as_deref(),
        )?;

        let sync = SyncEngine::new(
            config.sync.clone(),
            transport.clone(),
            storage.clone(),
            membership.clone(),
        );

        let fallback_addrs: HashMap<String, String> = config
            .node
            .initial_members
            .iter()
            .map(|m| (m.id.clone(), m.addr.clone()))
            .collect();

        let registry = ReplicaRegistry::new(
            node_id,
            config.replication.clone(),
            config.node.data_dir.clone(),
            transport.clone(),
            storage.clone(),
            membership.clone(),
            sync.clone(),
            fallback_addrs,
        );
        sync.set_registry(registry.clone());

        let router = Router::new(
            meta.clone(),
            transport.clone(),
            membership.clone(),
            config.gateway.clone(),
        );

        Ok(Arc::new(Self {
            config,
            transport,
            storage,
            membership,
            meta,
            registry,
            sync,
            router,
            started_at: timestamp_now(),
            events_rx: Mutex::new(Some(events_rx)),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Start background activities: map reconciliation, failover,
    /// refresh, sweeping, ring join and bootstrap. Does not bind any
    /// listener (tests drive the node through an in-memory transport).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.registry.spawn_watch(self.meta.map_watch());
        self.meta.spawn_refresh();
        self.sync.spawn_sweeper();

        let events_rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Internal("node already started".into()))?;
        tokio::spawn(run_failover(
            self.meta.clone(),
            self.registry.clone(),
            self.membership.clone(),
            self.transport.clone(),
            events_rx,
        ));

        if let Err(e) = self.membership.join(&self.config.node.initial_members).await {
            tracing::warn!("gossip join incomplete: {}", e);
        }

        self.maybe_bootstrap();
        Ok(())
    }

    /// The first-listed initial member installs the initial partition
    /// map when none has ever been committed.
    fn maybe_bootstrap(self: &Arc<Self>) {
        let first = match self.config.node.initial_members.first() {
            Some(m) => m.id.clone(),
            None => return,
        };
        if first != self.config.node.node_id || self.meta.epoch() > 0 {
            return;
        }

        let node = self.clone();
        tokio::spawn(async move {
            let partitions = node.build_initial_map();
            let retry = Duration::from_millis(node.config.meta.proposal_timeout_ms);
            loop {
                if node.meta.epoch() > 0 {
                    return;
                }
                match node
                    .meta
                    .propose(MetaChange::InitMap {
                        partitions: partitions.clone(),
                    })
                    .await
                {
                    Ok(map) => {
                        tracing::info!(
                            "bootstrapped partition map: {} partitions at epoch {}",
                            map.num_partitions(),
                            map.epoch
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::debug!("bootstrap proposal not committed yet: {}", e);
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        });
    }

    /// Round-robin placement of the initial partitions over the initial
    /// members.
    fn build_initial_map(&self) -> Vec<Partition> {
        let members = &self.config.node.initial_members;
        let n = members.len();
        let rf = self.config.replication.replication_factor.min(n).max(1);
        (0..self.config.replication.num_partitions)
            .map(|id| {
                let replicas: Vec<String> = (0..rf)
                    .map(|i| members[(id as usize + i) % n].id.clone())
                    .collect();
                Partition {
                    id,
                    leader: replicas[0].clone(),
                    replicas,
                    term: 1,
                }
            })
            .collect()
    }

    /// Run the node: peer wire server plus client HTTP API, until
    /// interrupted.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        self.start().await?;

        let peer_listener = tokio::net::TcpListener::bind(self.config.node.peer_addr).await?;
        tokio::spawn(serve_peer(
            peer_listener,
            self.clone() as Arc<dyn PeerHandler>,
        ));

        let state = GatewayState {
            node_id: self.config.node.node_id.clone(),
            started_at: self.started_at,
            router: self.router.clone(),
            membership: self.membership.clone(),
            meta: self.meta.clone(),
            registry: self.registry.clone(),
            sync: self.sync.clone(),
        };
        let app = create_router(state, self.config.gateway.max_value_bytes);
        let http_listener = tokio::net::TcpListener::bind(self.config.node.http_addr).await?;

        tracing::info!("Starting node: {}", self.config.node.node_id);
        tracing::info!("  Peer wire: {}", self.config.node.peer_addr);
        tracing::info!("  HTTP API:  {}", self.config.node.http_addr);
        if let Some(dir) = &self.config.node.data_dir {
            tracing::info!("  Data dir:  {}", dir.display());
        }

        tokio::select! {
            res = axum::serve(http_listener, app) => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down, leaving the gossip ring");
                self.membership.leave().await;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PeerHandler for Node {
    async fn handle(&self, msg: PeerMessage) -> PeerMessage {
        match msg {
            // === membership ===
            PeerMessage::Ping { from, seq, updates } => {
                let piggyback = self.membership.on_ping(from, updates).await;
                PeerMessage::Ack {
                    from: self.config.node.node_id.clone(),
                    seq,
                    updates: piggyback,
                }
            }
            PeerMessage::PingReq {
                from,
                seq,
                target,
                target_addr,
                updates,
            } => match self
                .membership
                .on_ping_req(from, target, target_addr, seq, updates)
                .await
            {
                Ok(()) => PeerMessage::Ack {
                    from: self.config.node.node_id.clone(),
                    seq,
                    updates: Vec::new(),
                },
                Err(e) => PeerMessage::failure(&e),
            },
            PeerMessage::Join {
                from,
                addr,
                incarnation,
            } => {
                let members = self.membership.on_join(from, addr, incarnation).await;
                PeerMessage::JoinAck { members }
            }
            PeerMessage::Leave { from, incarnation } => {
                self.membership.on_leave(from, incarnation).await;
                PeerMessage::LeaveAck
            }

            // === metadata ===
            PeerMessage::MetaPropose { from, epoch, change } => {
                self.meta.handle_propose(from, epoch, &change)
            }
            PeerMessage::MetaCommit { from, epoch, map } => {
                self.meta.handle_commit(from, epoch, map)
            }
            PeerMessage::MetaRead => self.meta.handle_read(),
            PeerMessage::LogStatus { partition } => match self.registry.get(partition) {
                Some(replica) => {
                    let (term, last_offset) = replica.log_status();
                    PeerMessage::LogStatusAck {
                        partition,
                        term,
                        last_offset,
                    }
                }
                None => PeerMessage::failure(&Error::NotFound(format!(
                    "partition {}",
                    partition
                ))),
            },

            // === replication ===
            PeerMessage::Append(req) => match self.registry.get(req.partition) {
                Some(replica) => match replica.handle_append(req) {
                    Ok(resp) => PeerMessage::AppendAck(resp),
                    Err(e) => PeerMessage::failure(&e),
                },
                None => PeerMessage::failure(&Error::NotFound(format!(
                    "partition {}",
                    req.partition
                ))),
            },
            PeerMessage::CommitNotice {
                partition,
                term,
                commit_offset,
            } => match self.registry.get(partition) {
                Some(replica) => match replica.handle_commit_notice(term, commit_offset) {
                    Ok(()) => PeerMessage::CommitNoticeAck,
                    Err(e) => PeerMessage::failure(&e),
                },
                None => PeerMessage::failure(&Error::NotFound(format!(
                    "partition {}",
                    partition
                ))),
            },

            // === sync ===
            PeerMessage::SyncRequest {
                partition,
                follower,
                last_offset,
            } => {
                self.sync.request(partition, follower, last_offset);
                PeerMessage::SyncAck
            }
            PeerMessage::SnapshotChunk(chunk) => {
                match self.sync.handle_snapshot_chunk(chunk).await {
                    Ok(ack) => ack,
                    Err(e) => PeerMessage::failure(&e),
                }
            }
            PeerMessage::TailEntries(batch) => match self.sync.handle_tail(batch) {
                Ok(ack) => ack,
                Err(e) => PeerMessage::failure(&e),
            },

            // === client operations ===
            PeerMessage::ClientOp { partition, op } => match self.registry.get(partition) {
                Some(replica) => match replica.execute(op).await {
                    Ok(result) => PeerMessage::ClientOpResult(result),
                    Err(e) => PeerMessage::failure(&e),
                },
                None => PeerMessage::failure(&Error::NotLeader {
                    partition,
                    leader: None,
                }),
            },

            // responses arriving as requests mean a peer bug; answer
            // with a typed failure instead of hanging up
            other => {
                tracing::debug!("unexpected request message: {:?}", other);
                PeerMessage::failure(&Error::Internal("unexpected message".into()))
            }
        }
    }
}
