//! Catch-up integration: stream-tail and snapshot convergence

mod common;

use common::{build_cluster, build_cluster_with, wait_for};
use herd::storage::StorageEngine;
use std::time::Duration;

async fn storage_matches(cluster: &common::TestCluster, partition: u64) -> bool {
    let mut snaps = Vec::new();
    for tn in &cluster.nodes {
        let snap = tn.storage.snapshot(partition).await.unwrap();
        snaps.push(snap);
    }
    snaps
        .iter()
        .all(|s| s.applied_offset == snaps[0].applied_offset && s.data == snaps[0].data)
}

async fn wait_storage_converged(cluster: &common::TestCluster, partition: u64, deadline: Duration) {
    let started = tokio::time::Instant::now();
    loop {
        if storage_matches(cluster, partition).await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("replica storage did not converge within {:?}", deadline);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

/// A follower that missed writes while isolated converges back to the
/// leader's committed log without manual intervention.
#[tokio::test(flavor = "multi_thread")]
async fn lagging_follower_converges_via_tail() {
    let cluster = build_cluster(3, 1, 3).await;
    wait_for(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|tn| tn.node.membership().view().members.len() == 3)
    })
    .await;

    let leader = cluster.leader_of("node-1", 0).unwrap();
    let lagger = cluster
        .nodes
        .iter()
        .map(|tn| tn.id.clone())
        .find(|id| *id != leader)
        .unwrap();
    let gateway = cluster
        .nodes
        .iter()
        .map(|tn| tn.id.clone())
        .find(|id| *id != leader && *id != lagger)
        .unwrap();
    let router = cluster.node(&gateway).node.router().clone();

    cluster.kill(&lagger);
    for i in 0..30 {
        router
            .put(&format!("tail-{:02}", i), vec![i as u8])
            .await
            .unwrap();
    }

    cluster.revive(&lagger);

    // heartbeat conflicts or the follower's own sync request close the gap
    let leader_commit = cluster
        .node(&leader)
        .node
        .registry()
        .get(0)
        .unwrap()
        .commit_offset();
    let lagger_node = cluster.node(&lagger);
    wait_for(Duration::from_secs(15), || {
        lagger_node
            .node
            .registry()
            .get(0)
            .map(|r| r.commit_offset() >= leader_commit)
            .unwrap_or(false)
    })
    .await;

    // byte-for-byte identical applied state everywhere
    wait_storage_converged(&cluster, 0, Duration::from_secs(10)).await;
}

/// When the gap exceeds the leader's retained log, catch-up goes through
/// a snapshot transfer and then switches to tail shipping.
#[tokio::test(flavor = "multi_thread")]
async fn deep_gap_converges_via_snapshot() {
    // tiny retention forces the snapshot path
    let cluster = build_cluster_with(3, 1, 3, |cfg| {
        cfg.replication.retained_entries = 4;
    })
    .await;
    wait_for(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|tn| tn.node.membership().view().members.len() == 3)
    })
    .await;

    let leader = cluster.leader_of("node-1", 0).unwrap();
    let lagger = cluster
        .nodes
        .iter()
        .map(|tn| tn.id.clone())
        .find(|id| *id != leader)
        .unwrap();
    let gateway = cluster
        .nodes
        .iter()
        .map(|tn| tn.id.clone())
        .find(|id| *id != leader && *id != lagger)
        .unwrap();
    let router = cluster.node(&gateway).node.router().clone();

    cluster.kill(&lagger);
    for i in 0..60 {
        router
            .put(&format!("snap-{:02}", i), format!("value-{}", i).into_bytes())
            .await
            .unwrap();
    }

    // the surviving pair has compacted past the lagger's position
    let leader_replica = cluster.node(&leader).node.registry().get(0).unwrap();
    assert!(leader_replica.log_bounds().0 > 1, "log did not compact");

    cluster.revive(&lagger);

    let leader_commit = leader_replica.commit_offset();
    let lagger_node = cluster.node(&lagger);
    wait_for(Duration::from_secs(20), || {
        lagger_node
            .node
            .registry()
            .get(0)
            .map(|r| r.commit_offset() >= leader_commit)
            .unwrap_or(false)
    })
    .await;

    wait_storage_converged(&cluster, 0, Duration::from_secs(10)).await;

    // and the recovered follower keeps taking live traffic
    router.put("post-snap", b"live".to_vec()).await.unwrap();
    wait_storage_converged(&cluster, 0, Duration::from_secs(10)).await;
}
