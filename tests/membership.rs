//! Membership integration: convergence, failure detection, departures

mod common;

use common::{build_cluster, wait_for};
use herd::membership::MemberState;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_converge_to_alive() {
    let cluster = build_cluster(3, 4, 3).await;

    wait_for(Duration::from_secs(5), || {
        cluster.nodes.iter().all(|tn| {
            let view = tn.node.membership().view();
            view.members.len() == 3
                && view
                    .members
                    .values()
                    .all(|m| m.state == MemberState::Alive)
        })
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn killed_node_is_suspected_then_dead() {
    let cluster = build_cluster(3, 4, 3).await;

    // let the ring converge first
    wait_for(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|tn| tn.node.membership().view().members.len() == 3)
    })
    .await;

    cluster.kill("node-3");

    // within probe interval + suspicion timeout the survivors agree
    wait_for(Duration::from_secs(10), || {
        ["node-1", "node-2"].iter().all(|id| {
            cluster
                .node(id)
                .node
                .membership()
                .view()
                .members
                .get("node-3")
                .map(|m| m.state == MemberState::Dead)
                .unwrap_or(false)
        })
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_leave_is_terminal() {
    let cluster = build_cluster(3, 4, 3).await;

    wait_for(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|tn| tn.node.membership().view().members.len() == 3)
    })
    .await;

    cluster.node("node-3").node.membership().leave().await;

    wait_for(Duration::from_secs(5), || {
        ["node-1", "node-2"].iter().all(|id| {
            cluster
                .node(id)
                .node
                .membership()
                .view()
                .members
                .get("node-3")
                .map(|m| m.state == MemberState::Left)
                .unwrap_or(false)
        })
    })
    .await;

    // Left is never refuted back to Alive by stale gossip
    tokio::time::sleep(Duration::from_millis(300)).await;
    for id in ["node-1", "node-2"] {
        let view = cluster.node(id).node.membership().view();
        assert_eq!(view.members["node-3"].state, MemberState::Left);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn revived_node_refutes_suspicion() {
    let cluster = build_cluster(3, 4, 3).await;

    wait_for(Duration::from_secs(5), || {
        cluster
            .nodes
            .iter()
            .all(|tn| tn.node.membership().view().members.len() == 3)
    })
    .await;

    cluster.kill("node-3");
    wait_for(Duration::from_secs(10), || {
        cluster
            .node("node-1")
            .node
            .membership()
            .view()
            .members
            .get("node-3")
            .map(|m| m.state != MemberState::Alive)
            .unwrap_or(false)
    })
    .await;

    cluster.revive("node-3");

    // the revived node sees claims about itself, bumps its incarnation
    // and re-announces Alive
    wait_for(Duration::from_secs(10), || {
        ["node-1", "node-2"].iter().all(|id| {
            cluster
                .node(id)
                .node
                .membership()
                .view()
                .members
                .get("node-3")
                .map(|m| m.state == MemberState::Alive)
                .unwrap_or(false)
        })
    })
    .await;
}
