//! Leader failover driven by membership events
//!
//! Consumes the membership event stream; when a partition leader is
//! declared Dead (or leaves), proposes a replacement leader at the next
//! term, preferring the surviving replica with the highest acknowledged
//! offset. All nodes run this task, but only the first alive voter in
//! the configured order acts, so proposals rarely duel; when they do,
//! the epoch grant rule picks exactly one winner.

use crate::common::{Error, NodeId};
use crate::membership::member::{MemberState, MembershipEvent};
use crate::membership::Membership;
use crate::meta::partition::{MetaChange, Partition};
use crate::meta::store::MetaStore;
use crate::net::message::PeerMessage;
use crate::net::transport::Transport;
use crate::repl::coordinator::ReplicaRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

pub async fn run_failover(
    meta: Arc<MetaStore>,
    registry: Arc<ReplicaRegistry>,
    membership: Membership,
    transport: Arc<dyn Transport>,
    events_rx: mpsc::UnboundedReceiver<MembershipEvent>,
) {
    let mut events = UnboundedReceiverStream::new(events_rx);
    while let Some(event) = events.next().await {
        let lost = match event {
            MembershipEvent::StateChanged {
                node,
                state: MemberState::Dead,
            } => node,
            MembershipEvent::Left(node) => node,
            _ => continue,
        };

        // deterministic coordinator choice: first voter alive in our view
        let view = membership.view();
        let coordinator = meta
            .voters()
            .iter()
            .find(|v| view.is_alive(&v.id))
            .map(|v| v.id.clone());
        if coordinator.as_deref() != Some(meta.node_id()) {
            tracing::debug!(
                "not failover coordinator for loss of {} (coordinator: {:?})",
                lost,
                coordinator
            );
            continue;
        }

        let map = meta.read_stale();
        let orphaned: Vec<Partition> = map.led_by(&lost).cloned().collect();
        if orphaned.is_empty() {
            continue;
        }
        tracing::warn!(
            "node {} lost; re-electing leaders for {} partitions",
            lost,
            orphaned.len()
        );

        for partition in orphaned {
            let meta = meta.clone();
            let registry = registry.clone();
            let membership = membership.clone();
            let transport = transport.clone();
            let lost = lost.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    failover_partition(meta, registry, membership, transport, partition, lost)
                        .await
                {
                    tracing::warn!("partition failover failed: {}", e);
                }
            });
        }
    }
}

/// Pick the best surviving replica (highest last offset, replica order
/// breaking ties) and propose it as leader at the next term.
async fn failover_partition(
    meta: Arc<MetaStore>,
    registry: Arc<ReplicaRegistry>,
    membership: Membership,
    transport: Arc<dyn Transport>,
    partition: Partition,
    lost: NodeId,
) -> crate::Result<()> {
    let view = membership.view();
    let survivors: Vec<NodeId> = partition
        .replicas
        .iter()
        .filter(|r| **r != lost && view.is_alive(r))
        .cloned()
        .collect();
    if survivors.is_empty() {
        return Err(Error::NoQuorum(format!(
            "no surviving replica for partition {}",
            partition.id
        )));
    }

    let mut best: Option<(NodeId, u64)> = None;
    for replica in &survivors {
        let last_offset = if replica == membership.local_id() {
            registry
                .get(partition.id)
                .map(|r| r.log_status().1)
                .unwrap_or(0)
        } else {
            let addr = match view.addr_of(replica) {
                Some(a) => a,
                None => continue,
            };
            let msg = PeerMessage::LogStatus {
                partition: partition.id,
            };
            match tokio::time::timeout(Duration::from_millis(1000), transport.call(&addr, msg))
                .await
            {
                Ok(Ok(PeerMessage::LogStatusAck { last_offset, .. })) => last_offset,
                _ => continue,
            }
        };
        let better = match &best {
            Some((_, offset)) => last_offset > *offset,
            None => true,
        };
        if better {
            best = Some((replica.clone(), last_offset));
        }
    }

    let (leader, offset) = best.ok_or_else(|| {
        Error::NodeUnreachable(format!(
            "no replica of partition {} answered a log status query",
            partition.id
        ))
    })?;
    tracing::info!(
        "proposing {} (offset {}) as leader of partition {} at term {}",
        leader,
        offset,
        partition.id,
        partition.term + 1
    );

    if leader == membership.local_id() {
        if let Some(replica) = registry.get(partition.id) {
            replica.begin_candidacy();
        }
    }

    let mut term = partition.term + 1;
    for attempt in 0..2 {
        let change = MetaChange::SetLeader {
            partition: partition.id,
            leader: leader.clone(),
            term,
        };
        match meta.propose(change).await {
            Ok(_) => return Ok(()),
            Err(Error::EpochStale { .. }) if attempt == 0 => {
                // someone else moved the map; re-check before retrying
                let map = meta
                    .read_snapshot(crate::meta::store::ReadConsistency::Linearizable)
                    .await?;
                match map.partition(partition.id) {
                    Some(p) if p.term > partition.term => return Ok(()),
                    Some(p) => term = p.term + 1,
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::NoQuorum(format!(
        "failover proposal for partition {} did not commit",
        partition.id
    )))
}
