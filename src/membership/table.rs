//! Membership table: the SWIM state rules
//!
//! Owned exclusively by the membership actor; every mutation goes
//! through `apply_update` so the incarnation/precedence rules live in
//! one place and can be tested without any networking.

use crate::common::{timestamp_now_millis, NodeId};
use crate::membership::gossip::DisseminationQueue;
use crate::membership::member::{
    Member, MemberState, MemberUpdate, MembershipEvent, MembershipView,
};
use std::collections::BTreeMap;

pub struct MemberTable {
    local_id: NodeId,
    local_addr: String,
    retransmit_factor: u32,
    members: BTreeMap<NodeId, Member>,
    pub queue: DisseminationQueue,
    events: Vec<MembershipEvent>,
}

impl MemberTable {
    pub fn new(local_id: NodeId, local_addr: String, retransmit_factor: u32) -> Self {
        let mut members = BTreeMap::new();
        members.insert(
            local_id.clone(),
            Member::new(local_id.clone(), local_addr.clone(), 0, MemberState::Alive),
        );
        Self {
            local_id,
            local_addr,
            retransmit_factor,
            members,
            queue: DisseminationQueue::new(),
            events: Vec::new(),
        }
    }

    pub fn local_incarnation(&self) -> u64 {
        self.members
            .get(&self.local_id)
            .map(|m| m.incarnation)
            .unwrap_or(0)
    }

    pub fn member(&self, node: &str) -> Option<&Member> {
        self.members.get(node)
    }

    pub fn view(&self) -> MembershipView {
        MembershipView {
            local: self.local_id.clone(),
            members: self.members.clone(),
        }
    }

    /// Collect pending events for the consumer channel.
    pub fn drain_events(&mut self) -> Vec<MembershipEvent> {
        std::mem::take(&mut self.events)
    }

    fn budget(&self) -> u32 {
        DisseminationQueue::budget(self.retransmit_factor, self.members.len())
    }

    fn disseminate(&mut self, update: MemberUpdate) {
        let budget = self.budget();
        self.queue.push(update, budget);
    }

    /// Apply one gossip claim. Returns true if local state changed.
    pub fn apply_update(&mut self, update: MemberUpdate) -> bool {
        if update.node == self.local_id {
            return self.apply_self_update(update);
        }

        let now = timestamp_now_millis();
        match self.members.get_mut(&update.node) {
            Some(m) => {
                m.last_heard = now;
                if m.state == MemberState::Left {
                    // terminal; nothing refutes a departure
                    return false;
                }
                let newer = update.incarnation > m.incarnation
                    || (update.incarnation == m.incarnation
                        && update.state.rank() > m.state.rank());
                if !newer {
                    return false;
                }
                m.incarnation = update.incarnation;
                if m.state != update.state {
                    m.state = update.state;
                    m.state_changed_at = now;
                    self.events.push(match update.state {
                        MemberState::Left => MembershipEvent::Left(update.node.clone()),
                        state => MembershipEvent::StateChanged {
                            node: update.node.clone(),
                            state,
                        },
                    });
                }
                if !update.addr.is_empty() {
                    m.addr = update.addr.clone();
                }
                self.disseminate(update);
                true
            }
            None => {
                if update.state == MemberState::Left || update.state == MemberState::Dead {
                    // no point resurrecting a record just to bury it
                    return false;
                }
                let member = Member::new(
                    update.node.clone(),
                    update.addr.clone(),
                    update.incarnation,
                    update.state,
                );
                self.members.insert(update.node.clone(), member);
                self.events.push(MembershipEvent::Joined(update.node.clone()));
                self.disseminate(update);
                true
            }
        }
    }

    /// Claims about ourselves: refute suspicion by bumping incarnation.
    fn apply_self_update(&mut self, update: MemberUpdate) -> bool {
        let local_inc = self.local_incarnation();
        match update.state {
            MemberState::Suspect | MemberState::Dead => {
                if update.incarnation < local_inc {
                    return false;
                }
                let refuted = update.incarnation + 1;
                if let Some(m) = self.members.get_mut(&self.local_id) {
                    m.incarnation = refuted;
                    m.state = MemberState::Alive;
                }
                tracing::info!(
                    "refuting {} claim about self, new incarnation {}",
                    update.state,
                    refuted
                );
                let alive = MemberUpdate {
                    node: self.local_id.clone(),
                    addr: self.local_addr.clone(),
                    incarnation: refuted,
                    state: MemberState::Alive,
                };
                self.disseminate(alive);
                true
            }
            MemberState::Alive => {
                if update.incarnation > local_inc {
                    if let Some(m) = self.members.get_mut(&self.local_id) {
                        m.incarnation = update.incarnation;
                    }
                    return true;
                }
                false
            }
            MemberState::Left => {
                // our own departure, echoed back
                if let Some(m) = self.members.get_mut(&self.local_id) {
                    m.state = MemberState::Left;
                }
                false
            }
        }
    }

    /// Admit a joining node. Returns the full table for the join reply.
    pub fn admit(&mut self, node: NodeId, addr: String, incarnation: u64) -> Vec<MemberUpdate> {
        let now = timestamp_now_millis();
        let incarnation = match self.members.get(&node) {
            Some(existing) => incarnation.max(existing.incarnation + 1),
            None => incarnation,
        };
        let fresh = !matches!(
            self.members.get(&node),
            Some(m) if m.state == MemberState::Alive && m.incarnation >= incarnation
        );
        self.members.insert(
            node.clone(),
            Member {
                id: node.clone(),
                addr: addr.clone(),
                incarnation,
                state: MemberState::Alive,
                last_heard: now,
                state_changed_at: now,
            },
        );
        if fresh {
            self.events.push(MembershipEvent::Joined(node.clone()));
            self.disseminate(MemberUpdate {
                node,
                addr,
                incarnation,
                state: MemberState::Alive,
            });
        }
        self.members.values().map(MemberUpdate::of).collect()
    }

    /// Local probe verdict: the target did not answer directly or
    /// indirectly.
    pub fn suspect(&mut self, node: &str) {
        let now = timestamp_now_millis();
        if let Some(m) = self.members.get_mut(node) {
            if m.state != MemberState::Alive {
                return;
            }
            m.state = MemberState::Suspect;
            m.state_changed_at = now;
            let update = MemberUpdate::of(m);
            tracing::info!("member {} is now suspect", node);
            self.events.push(MembershipEvent::StateChanged {
                node: node.to_string(),
                state: MemberState::Suspect,
            });
            self.disseminate(update);
        }
    }

    /// Confirm direct contact with the node. Direct contact is stronger
    /// evidence than any gossip claim, so it clears Suspect and Dead
    /// without waiting for a refutation.
    pub fn heard_from(&mut self, node: &str) {
        let now = timestamp_now_millis();
        if let Some(m) = self.members.get_mut(node) {
            m.last_heard = now;
            if m.state == MemberState::Suspect || m.state == MemberState::Dead {
                m.state = MemberState::Alive;
                m.state_changed_at = now;
                let update = MemberUpdate::of(m);
                self.events.push(MembershipEvent::StateChanged {
                    node: node.to_string(),
                    state: MemberState::Alive,
                });
                self.disseminate(update);
            }
        }
    }

    /// Convert overdue suspects to Dead. Returns the nodes declared dead.
    pub fn sweep_suspects(&mut self, suspicion_timeout_ms: u64) -> Vec<NodeId> {
        let now = timestamp_now_millis();
        let mut dead = Vec::new();
        for m in self.members.values_mut() {
            if m.state == MemberState::Suspect
                && now.saturating_sub(m.state_changed_at) >= suspicion_timeout_ms
            {
                m.state = MemberState::Dead;
                m.state_changed_at = now;
                dead.push(m.id.clone());
            }
        }
        for node in &dead {
            tracing::warn!("member {} declared dead (suspicion timeout)", node);
            let update = self.members.get(node).map(MemberUpdate::of).unwrap();
            self.events.push(MembershipEvent::StateChanged {
                node: node.clone(),
                state: MemberState::Dead,
            });
            self.disseminate(update);
        }
        dead
    }

    /// Graceful departure of a remote node; terminal.
    pub fn depart(&mut self, node: &str, incarnation: u64) {
        let now = timestamp_now_millis();
        if let Some(m) = self.members.get_mut(node) {
            if m.state == MemberState::Left {
                return;
            }
            m.state = MemberState::Left;
            m.incarnation = m.incarnation.max(incarnation);
            m.state_changed_at = now;
            let update = MemberUpdate::of(m);
            self.events.push(MembershipEvent::Left(node.to_string()));
            self.disseminate(update);
        }
    }

    /// Mark ourselves as leaving; returns the terminal announcement.
    pub fn leave_local(&mut self) -> MemberUpdate {
        if let Some(m) = self.members.get_mut(&self.local_id) {
            m.state = MemberState::Left;
            m.state_changed_at = timestamp_now_millis();
        }
        let update = MemberUpdate {
            node: self.local_id.clone(),
            addr: self.local_addr.clone(),
            incarnation: self.local_incarnation(),
            state: MemberState::Left,
        };
        self.disseminate(update.clone());
        update
    }

    /// Probe candidates: alive members other than ourselves.
    pub fn probe_candidates(&self) -> Vec<(NodeId, String)> {
        self.members
            .values()
            .filter(|m| m.id != self.local_id && m.state == MemberState::Alive)
            .map(|m| (m.id.clone(), m.addr.clone()))
            .collect()
    }

    /// Fallback contacts when nobody looks alive: anything not Left.
    /// Keeps an isolated node probing, so a healed partition resolves
    /// by direct contact instead of deadlocking on mutual suspicion.
    pub fn contact_candidates(&self) -> Vec<(NodeId, String)> {
        self.members
            .values()
            .filter(|m| m.id != self.local_id && m.state != MemberState::Left)
            .map(|m| (m.id.clone(), m.addr.clone()))
            .collect()
    }
}
