//! SWIM-style failure detector
//!
//! One actor task owns the member table; every mutation happens by
//! processing a command. Components read the cluster through a watch
//! snapshot and react to liveness changes through the event channel.

use crate::common::{Error, MembershipConfig, NodeId, Result, SeedMember};
use crate::membership::member::{MemberUpdate, MembershipEvent, MembershipView};
use crate::membership::table::MemberTable;
use crate::net::message::PeerMessage;
use crate::net::transport::Transport;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

enum Command {
    HandlePing {
        from: NodeId,
        updates: Vec<MemberUpdate>,
        reply: oneshot::Sender<Vec<MemberUpdate>>,
    },
    HandleJoin {
        from: NodeId,
        addr: String,
        incarnation: u64,
        reply: oneshot::Sender<Vec<MemberUpdate>>,
    },
    HandleLeave {
        from: NodeId,
        incarnation: u64,
    },
    ApplyUpdates(Vec<MemberUpdate>),
    ProbeResult {
        target: NodeId,
        ok: bool,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the membership actor. Cheap to clone.
#[derive(Clone)]
pub struct Membership {
    local_id: NodeId,
    local_addr: String,
    cmd_tx: mpsc::Sender<Command>,
    view_rx: watch::Receiver<MembershipView>,
    transport: Arc<dyn Transport>,
}

impl Membership {
    /// Spawn the actor. Returns the handle and the event stream consumed
    /// by the metadata failover task.
    pub fn spawn(
        cfg: MembershipConfig,
        local_id: NodeId,
        local_addr: String,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let table = MemberTable::new(local_id.clone(), local_addr.clone(), cfg.retransmit_factor);
        let (view_tx, view_rx) = watch::channel(table.view());

        let actor = Actor {
            cfg,
            table,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            view_tx,
            events_tx,
            transport: transport.clone(),
            rotation: Vec::new(),
            seq: 0,
        };
        tokio::spawn(actor.run());

        (
            Self {
                local_id,
                local_addr,
                cmd_tx,
                view_rx,
                transport,
            },
            events_rx,
        )
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Current read-only snapshot.
    pub fn view(&self) -> MembershipView {
        self.view_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MembershipView> {
        self.view_rx.clone()
    }

    /// Join the gossip ring through the seed list. Succeeds silently as a
    /// solo start when we are a seed ourselves and nobody answers.
    pub async fn join(&self, seeds: &[SeedMember]) -> Result<()> {
        let incarnation = self.view().members[&self.local_id].incarnation;
        let mut reached = false;
        for seed in seeds.iter().filter(|s| s.id != self.local_id) {
            let msg = PeerMessage::Join {
                from: self.local_id.clone(),
                addr: self.local_addr.clone(),
                incarnation,
            };
            match self.transport.call(&seed.addr, msg).await {
                Ok(PeerMessage::JoinAck { members }) => {
                    self.apply_updates(members).await;
                    reached = true;
                    break;
                }
                Ok(other) => {
                    tracing::debug!("unexpected join reply from {}: {:?}", seed.id, other);
                }
                Err(e) => {
                    tracing::debug!("seed {} not reachable: {}", seed.id, e);
                }
            }
        }
        let is_seed = seeds.iter().any(|s| s.id == self.local_id);
        if reached || is_seed {
            Ok(())
        } else {
            Err(Error::NodeUnreachable("no seed reachable".into()))
        }
    }

    /// Graceful departure: broadcast a terminal state nobody may refute.
    pub async fn leave(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Leave { reply }).await;
        let _ = rx.await;
    }

    pub async fn apply_updates(&self, updates: Vec<MemberUpdate>) {
        let _ = self.cmd_tx.send(Command::ApplyUpdates(updates)).await;
    }

    // === server dispatch ===

    pub async fn on_ping(&self, from: NodeId, updates: Vec<MemberUpdate>) -> Vec<MemberUpdate> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::HandlePing {
                from,
                updates,
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Probe `target` on behalf of `origin` (SWIM indirect probe).
    pub async fn on_ping_req(
        &self,
        origin: NodeId,
        target: NodeId,
        target_addr: String,
        seq: u64,
        updates: Vec<MemberUpdate>,
    ) -> Result<()> {
        self.apply_updates(updates).await;
        let msg = PeerMessage::Ping {
            from: self.local_id.clone(),
            seq,
            updates: Vec::new(),
        };
        match self.transport.call(&target_addr, msg).await {
            Ok(PeerMessage::Ack { updates, .. }) => {
                self.apply_updates(updates).await;
                let _ = self
                    .cmd_tx
                    .send(Command::ProbeResult {
                        target,
                        ok: true,
                    })
                    .await;
                Ok(())
            }
            Ok(_) | Err(_) => Err(Error::NodeUnreachable(format!(
                "indirect probe of {} for {} failed",
                target, origin
            ))),
        }
    }

    pub async fn on_join(
        &self,
        from: NodeId,
        addr: String,
        incarnation: u64,
    ) -> Vec<MemberUpdate> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::HandleJoin {
                from,
                addr,
                incarnation,
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn on_leave(&self, from: NodeId, incarnation: u64) {
        let _ = self
            .cmd_tx
            .send(Command::HandleLeave { from, incarnation })
            .await;
    }
}

struct Actor {
    cfg: MembershipConfig,
    table: MemberTable,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    view_tx: watch::Sender<MembershipView>,
    events_tx: mpsc::UnboundedSender<MembershipEvent>,
    transport: Arc<dyn Transport>,
    rotation: Vec<(NodeId, String)>,
    seq: u64,
}

impl Actor {
    async fn run(mut self) {
        let mut probe = tokio::time::interval(Duration::from_millis(self.cfg.probe_interval_ms));
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        let leaving = matches!(cmd, Command::Leave { .. });
                        self.handle_command(cmd);
                        if leaving {
                            break;
                        }
                    }
                    None => break,
                },
                _ = probe.tick() => {
                    self.sweep();
                    self.start_probe();
                }
            }
        }
    }

    fn publish(&mut self) {
        for event in self.table.drain_events() {
            let _ = self.events_tx.send(event);
        }
        let _ = self.view_tx.send(self.table.view());
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::HandlePing {
                from,
                updates,
                reply,
            } => {
                for u in updates {
                    self.table.apply_update(u);
                }
                self.table.heard_from(&from);
                self.publish();
                let _ = reply.send(self.table.queue.take(self.cfg.piggyback_max));
            }
            Command::HandleJoin {
                from,
                addr,
                incarnation,
                reply,
            } => {
                tracing::info!("member {} joining from {}", from, addr);
                let members = self.table.admit(from, addr, incarnation);
                self.publish();
                let _ = reply.send(members);
            }
            Command::HandleLeave { from, incarnation } => {
                tracing::info!("member {} left the cluster", from);
                self.table.depart(&from, incarnation);
                self.publish();
            }
            Command::ApplyUpdates(updates) => {
                let mut changed = false;
                for u in updates {
                    changed |= self.table.apply_update(u);
                }
                if changed {
                    self.publish();
                }
            }
            Command::ProbeResult { target, ok } => {
                if ok {
                    self.table.heard_from(&target);
                } else {
                    self.table.suspect(&target);
                }
                self.publish();
            }
            Command::Leave { reply } => {
                let update = self.table.leave_local();
                self.publish();
                let targets = self.table.probe_candidates();
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    for (node, addr) in targets {
                        let msg = PeerMessage::Leave {
                            from: update.node.clone(),
                            incarnation: update.incarnation,
                        };
                        if let Err(e) = transport.call(&addr, msg).await {
                            tracing::debug!("leave notice to {} failed: {}", node, e);
                        }
                    }
                    let _ = reply.send(());
                });
            }
        }
    }

    fn sweep(&mut self) {
        let dead = self.table.sweep_suspects(self.cfg.suspicion_timeout_ms);
        if !dead.is_empty() {
            self.publish();
        }
    }

    /// Probe the next member in a shuffled rotation; escalate through
    /// indirect probes before suspecting.
    fn start_probe(&mut self) {
        if self.rotation.is_empty() {
            self.rotation = self.table.probe_candidates();
            if self.rotation.is_empty() {
                self.rotation = self.table.contact_candidates();
            }
            self.rotation.shuffle(&mut rand::thread_rng());
        }
        let (target, target_addr) = match self.rotation.pop() {
            Some(t) => t,
            None => return,
        };
        // skip members that departed since the rotation was built
        match self.table.member(&target) {
            Some(m) if m.state != crate::membership::member::MemberState::Left => {}
            _ => return,
        }

        self.seq += 1;
        let seq = self.seq;
        let updates = self.table.queue.take(self.cfg.piggyback_max);

        let mut relays = self.table.probe_candidates();
        relays.retain(|(id, _)| *id != target);
        relays.shuffle(&mut rand::thread_rng());
        relays.truncate(self.cfg.indirect_probes);

        let transport = self.transport.clone();
        let cmd_tx = self.cmd_tx.clone();
        let local = self.table.view().local;
        let probe_timeout = Duration::from_millis(self.cfg.probe_timeout_ms);

        tokio::spawn(async move {
            let ping = PeerMessage::Ping {
                from: local.clone(),
                seq,
                updates: updates.clone(),
            };
            let direct = tokio::time::timeout(probe_timeout, transport.call(&target_addr, ping));
            if let Ok(Ok(PeerMessage::Ack { updates, .. })) = direct.await {
                let _ = cmd_tx.send(Command::ApplyUpdates(updates)).await;
                let _ = cmd_tx
                    .send(Command::ProbeResult {
                        target,
                        ok: true,
                    })
                    .await;
                return;
            }

            // indirect round through a few relays
            let mut indirect_ok = false;
            for (relay, relay_addr) in relays {
                let msg = PeerMessage::PingReq {
                    from: local.clone(),
                    seq,
                    target: target.clone(),
                    target_addr: target_addr.clone(),
                    updates: updates.clone(),
                };
                match tokio::time::timeout(probe_timeout, transport.call(&relay_addr, msg)).await {
                    Ok(Ok(PeerMessage::Ack { updates, .. })) => {
                        let _ = cmd_tx.send(Command::ApplyUpdates(updates)).await;
                        indirect_ok = true;
                        break;
                    }
                    _ => {
                        tracing::trace!("indirect probe via {} failed", relay);
                    }
                }
            }

            let _ = cmd_tx
                .send(Command::ProbeResult {
                    target,
                    ok: indirect_ok,
                })
                .await;
        });
    }
}
