//! Partition map types
//!
//! The partition map is the single source of truth for replica sets and
//! leadership. It is only ever mutated by applying a committed
//! `MetaChange` at a higher epoch.

use crate::common::{NodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One partition's replica set and leadership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: u64,
    /// Ordered replica set
    pub replicas: Vec<NodeId>,
    pub leader: NodeId,
    /// Monotonic leadership term
    pub term: u64,
}

impl Partition {
    pub fn has_replica(&self, node: &str) -> bool {
        self.replicas.iter().any(|r| r == node)
    }

    pub fn majority(&self) -> usize {
        self.replicas.len() / 2 + 1
    }
}

/// A proposed mutation of the partition map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetaChange {
    /// Bootstrap: install the initial map (only valid on an empty map)
    InitMap { partitions: Vec<Partition> },
    /// Leadership change for one partition; `term` must exceed the
    /// partition's current term
    SetLeader {
        partition: u64,
        leader: NodeId,
        term: u64,
    },
    /// Replace a partition's replica set
    SetReplicas { partition: u64, replicas: Vec<NodeId> },
    /// Remove a node from every replica set it occupies, substituting
    /// per-partition replacements chosen by the proposer
    RemoveNode {
        node: NodeId,
        substitutes: Vec<(u64, Option<NodeId>)>,
    },
}

/// The versioned, cluster-wide partition map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionMap {
    /// MetadataEpoch: strictly increasing across the cluster lifetime
    pub epoch: u64,
    pub partitions: BTreeMap<u64, Partition>,
}

impl PartitionMap {
    pub fn partition(&self, id: u64) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn num_partitions(&self) -> u64 {
        self.partitions.len() as u64
    }

    /// Partitions currently led by `node`
    pub fn led_by<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Partition> {
        self.partitions.values().filter(move |p| p.leader == node)
    }

    /// Partitions hosting a replica on `node`
    pub fn hosted_by<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Partition> {
        self.partitions.values().filter(move |p| p.has_replica(node))
    }

    /// Apply a change in place. The caller owns epoch management; this
    /// only validates and mutates partition contents.
    pub fn apply(&mut self, change: &MetaChange) -> Result<()> {
        match change {
            MetaChange::InitMap { partitions } => {
                if !self.partitions.is_empty() {
                    return Err(crate::Error::Internal(
                        "partition map already initialized".into(),
                    ));
                }
                for p in partitions {
                    if p.replicas.is_empty() || !p.has_replica(&p.leader) {
                        return Err(crate::Error::InvalidConfig(format!(
                            "partition {} has invalid replica set",
                            p.id
                        )));
                    }
                    self.partitions.insert(p.id, p.clone());
                }
                Ok(())
            }
            MetaChange::SetLeader {
                partition,
                leader,
                term,
            } => {
                let p = self
                    .partitions
                    .get_mut(partition)
                    .ok_or_else(|| crate::Error::NotFound(format!("partition {}", partition)))?;
                if *term <= p.term {
                    return Err(crate::Error::TermMismatch {
                        partition: *partition,
                        local: p.term,
                        remote: *term,
                    });
                }
                if !p.has_replica(leader) {
                    return Err(crate::Error::InvalidConfig(format!(
                        "{} is not a replica of partition {}",
                        leader, partition
                    )));
                }
                p.leader = leader.clone();
                p.term = *term;
                Ok(())
            }
            MetaChange::SetReplicas {
                partition,
                replicas,
            } => {
                if replicas.is_empty() {
                    return Err(crate::Error::InvalidConfig(
                        "replica set cannot be empty".into(),
                    ));
                }
                let p = self
                    .partitions
                    .get_mut(partition)
                    .ok_or_else(|| crate::Error::NotFound(format!("partition {}", partition)))?;
                p.replicas = replicas.clone();
                if !p.has_replica(&p.leader) {
                    p.leader = p.replicas[0].clone();
                    p.term += 1;
                }
                Ok(())
            }
            MetaChange::RemoveNode { node, substitutes } => {
                let subs: BTreeMap<u64, Option<NodeId>> = substitutes.iter().cloned().collect();
                for p in self.partitions.values_mut() {
                    if !p.has_replica(node) {
                        continue;
                    }
                    match subs.get(&p.id) {
                        Some(Some(replacement)) if !p.has_replica(replacement) => {
                            for r in p.replicas.iter_mut() {
                                if r == node {
                                    *r = replacement.clone();
                                }
                            }
                        }
                        _ => p.replicas.retain(|r| r != node),
                    }
                    if p.replicas.is_empty() {
                        return Err(crate::Error::InvalidConfig(format!(
                            "removing {} would empty partition {}",
                            node, p.id
                        )));
                    }
                    if &p.leader == node {
                        p.leader = p.replicas[0].clone();
                        p.term += 1;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(partitions: Vec<Partition>) -> PartitionMap {
        let mut map = PartitionMap::default();
        map.apply(&MetaChange::InitMap { partitions }).unwrap();
        map.epoch = 1;
        map
    }

    fn part(id: u64, replicas: &[&str], leader: &str, term: u64) -> Partition {
        Partition {
            id,
            replicas: replicas.iter().map(|s| s.to_string()).collect(),
            leader: leader.to_string(),
            term,
        }
    }

    #[test]
    fn test_init_map_once() {
        let mut map = map_with(vec![part(0, &["a", "b", "c"], "a", 1)]);
        let again = MetaChange::InitMap {
            partitions: vec![part(1, &["a"], "a", 1)],
        };
        assert!(map.apply(&again).is_err());
    }

    #[test]
    fn test_set_leader_requires_higher_term() {
        let mut map = map_with(vec![part(0, &["a", "b", "c"], "a", 3)]);

        let stale = MetaChange::SetLeader {
            partition: 0,
            leader: "b".into(),
            term: 3,
        };
        assert!(map.apply(&stale).is_err());

        let ok = MetaChange::SetLeader {
            partition: 0,
            leader: "b".into(),
            term: 4,
        };
        map.apply(&ok).unwrap();
        assert_eq!(map.partition(0).unwrap().leader, "b");
        assert_eq!(map.partition(0).unwrap().term, 4);
    }

    #[test]
    fn test_set_leader_must_be_replica() {
        let mut map = map_with(vec![part(0, &["a", "b"], "a", 1)]);
        let bad = MetaChange::SetLeader {
            partition: 0,
            leader: "z".into(),
            term: 2,
        };
        assert!(map.apply(&bad).is_err());
    }

    #[test]
    fn test_remove_node_substitutes_and_fails_over() {
        let mut map = map_with(vec![
            part(0, &["a", "b", "c"], "a", 1),
            part(1, &["b", "c", "d"], "b", 1),
        ]);

        let change = MetaChange::RemoveNode {
            node: "a".into(),
            substitutes: vec![(0, Some("d".to_string()))],
        };
        map.apply(&change).unwrap();

        let p0 = map.partition(0).unwrap();
        assert_eq!(p0.replicas, vec!["d", "b", "c"]);
        assert_eq!(p0.leader, "d");
        assert_eq!(p0.term, 2); // leader change bumped the term
        assert_eq!(map.partition(1).unwrap().replicas, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_set_replicas_keeps_leader_when_present() {
        let mut map = map_with(vec![part(0, &["a", "b", "c"], "b", 5)]);
        map.apply(&MetaChange::SetReplicas {
            partition: 0,
            replicas: vec!["b".into(), "c".into(), "d".into()],
        })
        .unwrap();
        let p = map.partition(0).unwrap();
        assert_eq!(p.leader, "b");
        assert_eq!(p.term, 5);
    }
}
