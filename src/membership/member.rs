//! Member records and the read-only membership view

use crate::common::{timestamp_now_millis, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Liveness state of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl MemberState {
    /// Precedence between claims at the same incarnation: a higher-ranked
    /// state overrides a lower-ranked one. `Left` is terminal.
    pub fn rank(&self) -> u8 {
        match self {
            MemberState::Alive => 0,
            MemberState::Suspect => 1,
            MemberState::Dead => 2,
            MemberState::Left => 3,
        }
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Alive => write!(f, "alive"),
            MemberState::Suspect => write!(f, "suspect"),
            MemberState::Dead => write!(f, "dead"),
            MemberState::Left => write!(f, "left"),
        }
    }
}

/// One member of the cluster as known locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub addr: String,
    pub incarnation: u64,
    pub state: MemberState,
    /// Last time we heard from or about this member (unix millis)
    pub last_heard: u64,
    /// When the current state was entered (unix millis)
    pub state_changed_at: u64,
}

impl Member {
    pub fn new(id: NodeId, addr: String, incarnation: u64, state: MemberState) -> Self {
        let now = timestamp_now_millis();
        Self {
            id,
            addr,
            incarnation,
            state,
            last_heard: now,
            state_changed_at: now,
        }
    }
}

/// A state claim about a member, as carried by gossip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub node: NodeId,
    pub addr: String,
    pub incarnation: u64,
    pub state: MemberState,
}

impl MemberUpdate {
    pub fn of(m: &Member) -> Self {
        Self {
            node: m.id.clone(),
            addr: m.addr.clone(),
            incarnation: m.incarnation,
            state: m.state,
        }
    }
}

/// Read-only snapshot published by the membership actor
#[derive(Debug, Clone, Serialize)]
pub struct MembershipView {
    pub local: NodeId,
    pub members: BTreeMap<NodeId, Member>,
}

impl MembershipView {
    pub fn addr_of(&self, node: &str) -> Option<String> {
        self.members.get(node).map(|m| m.addr.clone())
    }

    pub fn is_alive(&self, node: &str) -> bool {
        if node == self.local {
            return true;
        }
        self.members
            .get(node)
            .map(|m| m.state == MemberState::Alive)
            .unwrap_or(false)
    }

    pub fn alive_members(&self) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(|m| m.state == MemberState::Alive)
    }
}

/// Emitted by the membership actor for consumers (metadata failover)
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(NodeId),
    StateChanged { node: NodeId, state: MemberState },
    Left(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_precedence() {
        assert!(MemberState::Dead.rank() > MemberState::Suspect.rank());
        assert!(MemberState::Suspect.rank() > MemberState::Alive.rank());
        assert!(MemberState::Left.rank() > MemberState::Dead.rank());
    }

    #[test]
    fn test_view_alive_lookup() {
        let mut members = BTreeMap::new();
        members.insert(
            "node-2".to_string(),
            Member::new(
                "node-2".into(),
                "127.0.0.1:7002".into(),
                0,
                MemberState::Suspect,
            ),
        );
        let view = MembershipView {
            local: "node-1".into(),
            members,
        };
        assert!(view.is_alive("node-1")); // self is always alive
        assert!(!view.is_alive("node-2"));
        assert!(!view.is_alive("node-9"));
        assert_eq!(view.addr_of("node-2").as_deref(), Some("127.0.0.1:7002"));
    }
}
