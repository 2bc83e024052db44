//! Dissemination queue for piggybacked membership updates
//!
//! Each state change is retransmitted a bounded number of times
//! (proportional to log2 of the cluster size), which propagates updates
//! in O(log N) probe rounds without a broadcast.

use crate::membership::member::MemberUpdate;

struct Queued {
    update: MemberUpdate,
    remaining: u32,
}

#[derive(Default)]
pub struct DisseminationQueue {
    queue: Vec<Queued>,
}

impl DisseminationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retransmit budget for a cluster of `n` members.
    pub fn budget(retransmit_factor: u32, n: usize) -> u32 {
        let log = (usize::BITS - n.max(1).leading_zeros()) as u32;
        retransmit_factor * log.max(1)
    }

    /// Queue an update, superseding any queued claim about the same node.
    pub fn push(&mut self, update: MemberUpdate, budget: u32) {
        self.queue.retain(|q| q.update.node != update.node);
        self.queue.push(Queued {
            update,
            remaining: budget,
        });
    }

    /// Take up to `max` updates for piggybacking, consuming one
    /// transmission from each and dropping exhausted entries.
    pub fn take(&mut self, max: usize) -> Vec<MemberUpdate> {
        let mut out = Vec::new();
        for q in self.queue.iter_mut().take(max) {
            out.push(q.update.clone());
            q.remaining = q.remaining.saturating_sub(1);
        }
        self.queue.retain(|q| q.remaining > 0);
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::member::MemberState;

    fn update(node: &str, incarnation: u64, state: MemberState) -> MemberUpdate {
        MemberUpdate {
            node: node.to_string(),
            addr: format!("127.0.0.1:{}", 7000),
            incarnation,
            state,
        }
    }

    #[test]
    fn test_budget_grows_with_cluster() {
        assert!(DisseminationQueue::budget(3, 16) > DisseminationQueue::budget(3, 2));
        assert!(DisseminationQueue::budget(3, 1) >= 3);
    }

    #[test]
    fn test_take_consumes_budget() {
        let mut q = DisseminationQueue::new();
        q.push(update("node-2", 1, MemberState::Suspect), 2);

        assert_eq!(q.take(8).len(), 1);
        assert_eq!(q.take(8).len(), 1);
        assert!(q.take(8).is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn test_newer_claim_supersedes() {
        let mut q = DisseminationQueue::new();
        q.push(update("node-2", 1, MemberState::Suspect), 4);
        q.push(update("node-2", 2, MemberState::Alive), 4);

        let taken = q.take(8);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].incarnation, 2);
        assert_eq!(taken[0].state, MemberState::Alive);
    }
}
