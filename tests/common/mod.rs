//! In-process cluster harness for integration tests
//!
//! Nodes run against the in-memory transport with shortened timers, so
//! crashes and partitions are simulated by deregistering an address.

// not every suite uses every helper
#![allow(dead_code)]

use herd::common::{Config, SeedMember};
use herd::net::mem::MemNet;
use herd::storage::MemoryEngine;
use herd::Node;
use std::sync::Arc;
use std::time::Duration;

pub struct TestNode {
    pub id: String,
    pub addr: String,
    pub node: Arc<Node>,
    pub storage: Arc<MemoryEngine>,
}

pub struct TestCluster {
    pub net: MemNet,
    pub nodes: Vec<TestNode>,
}

pub fn test_config(i: usize, members: &[SeedMember], partitions: u64, replicas: usize) -> Config {
    let mut cfg = Config::default();
    cfg.node.node_id = members[i].id.clone();
    cfg.node.advertise_addr = Some(members[i].addr.clone());
    cfg.node.data_dir = None;
    cfg.node.initial_members = members.to_vec();

    cfg.membership.probe_interval_ms = 50;
    cfg.membership.probe_timeout_ms = 40;
    cfg.membership.suspicion_timeout_ms = 250;

    cfg.meta.proposal_timeout_ms = 500;
    cfg.meta.refresh_interval_ms = 100;

    cfg.replication.num_partitions = partitions;
    cfg.replication.replication_factor = replicas;
    cfg.replication.append_timeout_ms = 1000;
    cfg.replication.heartbeat_interval_ms = 50;

    cfg.sync.call_timeout_ms = 1000;
    cfg.sync.session_idle_timeout_ms = 2000;

    cfg.gateway.request_timeout_ms = 2000;
    cfg
}

pub async fn build_cluster(n: usize, partitions: u64, replicas: usize) -> TestCluster {
    build_cluster_with(n, partitions, replicas, |cfg| {
        let _ = cfg;
    })
    .await
}

pub async fn build_cluster_with<F>(
    n: usize,
    partitions: u64,
    replicas: usize,
    tweak: F,
) -> TestCluster
where
    F: Fn(&mut Config),
{
    let members: Vec<SeedMember> = (1..=n)
        .map(|i| SeedMember {
            id: format!("node-{}", i),
            addr: format!("mem://node-{}", i),
        })
        .collect();

    let net = MemNet::new();
    let mut nodes = Vec::new();
    for i in 0..n {
        let mut cfg = test_config(i, &members, partitions, replicas);
        tweak(&mut cfg);
        let storage = Arc::new(MemoryEngine::new());
        let transport = Arc::new(net.transport(&members[i].addr));
        let node = Node::new(cfg, transport, storage.clone()).unwrap();
        net.register(&members[i].addr, node.clone());
        nodes.push(TestNode {
            id: members[i].id.clone(),
            addr: members[i].addr.clone(),
            node,
            storage,
        });
    }

    for tn in &nodes {
        tn.node.start().await.unwrap();
    }

    let cluster = TestCluster { net, nodes };
    cluster.wait_for_epoch(1).await;

    // every node must have opened the replicas it hosts before traffic
    // starts, or early appends race replica creation
    wait_for(Duration::from_secs(10), || {
        cluster.nodes.iter().all(|tn| {
            let map = tn.node.meta().read_stale();
            map.partitions
                .values()
                .filter(|p| p.has_replica(&tn.id))
                .all(|p| tn.node.registry().get(p.id).is_some())
        })
    })
    .await;

    cluster
}

impl TestCluster {
    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    /// Simulate a crash: the node is unreachable in both directions.
    pub fn kill(&self, id: &str) {
        let tn = self.node(id);
        self.net.deregister(&tn.addr);
    }

    /// Bring a killed node back (same process state, as after a stall).
    pub fn revive(&self, id: &str) {
        let tn = self.node(id);
        self.net
            .register(&tn.addr, tn.node.clone() as Arc<dyn herd::net::PeerHandler>);
    }

    pub async fn wait_for_epoch(&self, epoch: u64) {
        wait_for(Duration::from_secs(10), || {
            self.nodes
                .iter()
                .filter(|tn| self.net.is_registered(&tn.addr))
                .all(|tn| tn.node.meta().epoch() >= epoch)
        })
        .await;
    }

    /// The current leader id of a partition, per the given node's map.
    pub fn leader_of(&self, observer: &str, partition: u64) -> Option<String> {
        self.node(observer)
            .node
            .meta()
            .read_stale()
            .partition(partition)
            .map(|p| p.leader.clone())
    }
}

/// Poll until `cond` holds or the deadline passes; panics on timeout.
pub async fn wait_for<F: Fn() -> bool>(deadline: Duration, cond: F) {
    let started = tokio::time::Instant::now();
    loop {
        if cond() {
            return;
        }
        if started.elapsed() > deadline {
            panic!("condition not met within {:?}", deadline);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Like `wait_for`, but returns false instead of panicking.
pub async fn try_wait_for<F: Fn() -> bool>(deadline: Duration, cond: F) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if cond() {
            return true;
        }
        if started.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
