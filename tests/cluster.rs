//! End-to-end failover scenarios on a 5-node cluster

mod common;

use common::{build_cluster, wait_for};
use herd::repl::ReplicaRole;
use std::collections::HashMap;
use std::time::Duration;

/// Kill a leader: a new leader is elected at a strictly higher term
/// within the failure-detection bound, and no committed write is lost.
#[tokio::test(flavor = "multi_thread")]
async fn leader_failover_preserves_committed_writes() {
    let cluster = build_cluster(5, 4, 3).await;

    // wait until the ring is fully connected so failure detection and
    // routing have addresses for everyone
    wait_for(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|tn| tn.node.membership().view().members.len() == 5)
    })
    .await;

    // write through a gateway we will not kill
    let router = cluster.node("node-5").node.router().clone();
    let mut written = HashMap::new();
    for i in 0..40 {
        let key = format!("k-{:03}", i);
        let value = format!("value-{}", i).into_bytes();
        router.put(&key, value.clone()).await.unwrap();
        written.insert(key, value);
    }

    // pick the leader with the most partitions that is not our gateway
    let map = cluster.node("node-5").node.meta().read_stale();
    let mut counts: HashMap<String, u64> = HashMap::new();
    for p in map.partitions.values() {
        *counts.entry(p.leader.clone()).or_default() += 1;
    }
    let victim = counts
        .iter()
        .filter(|(id, _)| id.as_str() != "node-5")
        .max_by_key(|(_, n)| **n)
        .map(|(id, _)| id.clone())
        .expect("some non-gateway leader");
    let victim_terms: HashMap<u64, u64> = map
        .partitions
        .values()
        .filter(|p| p.leader == victim)
        .map(|p| (p.id, p.term))
        .collect();
    assert!(!victim_terms.is_empty());

    cluster.kill(&victim);

    // every partition the victim led gets a new leader at a higher term
    wait_for(Duration::from_secs(15), || {
        let map = cluster.node("node-5").node.meta().read_stale();
        victim_terms.iter().all(|(id, old_term)| {
            map.partition(*id)
                .map(|p| p.leader != victim && p.term > *old_term)
                .unwrap_or(false)
        })
    })
    .await;

    // committed writes all survive the transition
    for (key, value) in &written {
        let got = router.get(key).await.unwrap_or_else(|e| {
            panic!("get {} failed after failover: {}", key, e);
        });
        assert_eq!(got.as_ref(), Some(value), "lost committed write {}", key);
    }
}

/// The new leader is the surviving replica with the highest acknowledged
/// offset, and it actually holds the Leader role.
#[tokio::test(flavor = "multi_thread")]
async fn new_leader_holds_role_after_failover() {
    let cluster = build_cluster(3, 1, 3).await;

    wait_for(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|tn| tn.node.membership().view().members.len() == 3)
    })
    .await;

    let leader = cluster.leader_of("node-1", 0).unwrap();
    let gateway = cluster
        .nodes
        .iter()
        .map(|tn| tn.id.clone())
        .find(|id| *id != leader)
        .unwrap();
    let router = cluster.node(&gateway).node.router().clone();

    router.put("pre-failover", b"v".to_vec()).await.unwrap();

    let old_term = cluster
        .node(&gateway)
        .node
        .meta()
        .read_stale()
        .partition(0)
        .unwrap()
        .term;

    cluster.kill(&leader);

    wait_for(Duration::from_secs(15), || {
        let map = cluster.node(&gateway).node.meta().read_stale();
        map.partition(0)
            .map(|p| p.leader != leader && p.term > old_term)
            .unwrap_or(false)
    })
    .await;

    let new_leader = cluster.leader_of(&gateway, 0).unwrap();
    wait_for(Duration::from_secs(5), || {
        cluster
            .node(&new_leader)
            .node
            .registry()
            .get(0)
            .map(|r| r.role() == ReplicaRole::Leader)
            .unwrap_or(false)
    })
    .await;

    // and the committed write is served by the new leadership
    let got = router.get("pre-failover").await.unwrap();
    assert_eq!(got, Some(b"v".to_vec()));

    // writes keep flowing at the higher term
    router.put("post-failover", b"w".to_vec()).await.unwrap();
    assert_eq!(
        router.get("post-failover").await.unwrap(),
        Some(b"w".to_vec())
    );
}
