//! Integration tests for the Raft-backed store.
//!
//! These start real nodes with the peer transport on loopback, drive them
//! through the command protocol and check replication, leader-only writes,
//! membership changes and durable restart.
//!
//! **Note:** These tests require network socket access (TCP listener on 127.0.0.1).
//!
//! To run these tests:
//! ```bash
//! cargo test --test raft_integration_tests
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use raftkv::config::NodeConfig;
use raftkv::join::join_cluster;
use raftkv::raft::RaftNode;
use raftkv::server::CommandServer;
use raftkv::store::Store;
use raftkv::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;

// ============================================================================
// Test Utilities
// ============================================================================

/// Atomic port counter to ensure unique ports per test.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(24000);

/// Get a unique port for a test node.
fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Create a test configuration with fast timeouts.
fn test_config(name: &str, raft_dir: &Path, in_memory: bool) -> NodeConfig {
    let mut config = NodeConfig::new(
        name,
        "127.0.0.1:0",
        format!("127.0.0.1:{}", next_port()),
        raft_dir,
    );
    config.in_memory = in_memory;
    config.heartbeat_interval = Duration::from_millis(50);
    config.election_timeout_min = Duration::from_millis(150);
    config.election_timeout_max = Duration::from_millis(300);
    config.snapshot_threshold = 10;
    config.commit_timeout = Duration::from_secs(5);
    config.max_pending_proposals = 100;
    config
}

/// A node with its command server running.
struct TestNode {
    node: Arc<RaftNode>,
    server: Arc<CommandServer>,
    cmd_addr: String,
}

impl TestNode {
    async fn start(config: &NodeConfig, bootstrap: bool) -> Self {
        let node = Arc::new(RaftNode::open(config, bootstrap).await.unwrap());
        let server = Arc::new(
            CommandServer::new("127.0.0.1:0", node.clone() as Arc<dyn Store>)
                .await
                .unwrap(),
        );
        let cmd_addr = server.local_addr().unwrap().to_string();
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        Self {
            node,
            server,
            cmd_addr,
        }
    }

    async fn command(&self, line: &str) -> String {
        let stream = TcpStream::connect(&self.cmd_addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        let mut reply = String::new();
        tokio::time::timeout(
            Duration::from_secs(10),
            BufReader::new(read).read_line(&mut reply),
        )
        .await
        .expect("reply timed out")
        .unwrap();
        reply.trim_end().to_string()
    }

    async fn stop(&self) {
        self.server.shutdown();
        self.node.shutdown().await.unwrap();
    }
}

/// Wait for a specific node to become leader.
async fn wait_for_leader(node: &RaftNode, timeout_duration: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if node.is_leader() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Poll a node's local state until `key` holds `expected`.
async fn wait_for_value(node: &RaftNode, key: &str, expected: &str) -> bool {
    for _ in 0..200 {
        if let Ok(value) = node.get(key).await
            && value == expected
        {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn wait_for_voters(node: &RaftNode, count: usize) -> bool {
    for _ in 0..200 {
        if node.voters().len() == count {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Bootstrap one node and join `followers` more through the command protocol.
async fn start_cluster(dir: &Path, followers: usize) -> Vec<TestNode> {
    let leader = TestNode::start(&test_config("node0", dir, true), true).await;
    assert!(wait_for_leader(&leader.node, Duration::from_secs(5)).await);

    let mut nodes = vec![leader];
    for i in 1..=followers {
        let name = format!("node{}", i);
        let follower = TestNode::start(&test_config(&name, dir, true), false).await;
        join_cluster(&nodes[0].cmd_addr, &name, follower.node.raft_addr(), 3)
            .await
            .unwrap();
        nodes.push(follower);
    }
    nodes
}

// ============================================================================
// Single Node
// ============================================================================

#[tokio::test]
async fn test_single_node_set_get() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(&test_config("solo", dir.path(), true), true).await;
    assert!(wait_for_leader(&node.node, Duration::from_secs(5)).await);

    assert_eq!(node.command("SET a 1").await, "Success");
    assert_eq!(node.command("GET a").await, "1");
    assert_eq!(node.command("DEL missing").await, "Success");
    assert_eq!(node.command("GET missing").await, "key not found: missing");

    node.stop().await;
}

#[tokio::test]
async fn test_writes_survive_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(&test_config("snap", dir.path(), true), true).await;
    assert!(wait_for_leader(&node.node, Duration::from_secs(5)).await);

    // Several snapshot thresholds' worth of writes.
    for i in 0..35 {
        node.node
            .set(&format!("k{}", i), &i.to_string())
            .await
            .unwrap();
    }
    for i in 0..35 {
        assert_eq!(node.node.get(&format!("k{}", i)).await.unwrap(), i.to_string());
    }

    node.stop().await;
}

#[tokio::test]
async fn test_uninitialized_node_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(&test_config("idle", dir.path(), true), false).await;

    assert!(!node.node.is_initialized());
    assert_eq!(node.command("SET a 1").await, "node is not the leader");
    assert_eq!(node.command("GET a").await, "key not found: a");

    node.stop().await;
}

// ============================================================================
// Multi-Node Cluster
// ============================================================================

#[tokio::test]
async fn test_three_node_replication() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = start_cluster(dir.path(), 2).await;

    assert!(wait_for_voters(&nodes[0].node, 3).await);
    assert_eq!(nodes[0].command("SET color blue").await, "Success");

    for node in &nodes {
        assert!(
            wait_for_value(&node.node, "color", "blue").await,
            "{} did not receive the write",
            node.node.name()
        );
    }

    assert_eq!(nodes[0].command("DEL color").await, "Success");
    for node in &nodes {
        let mut gone = false;
        for _ in 0..200 {
            if matches!(node.node.get("color").await, Err(Error::NotFound(_))) {
                gone = true;
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        assert!(gone, "{} still has the key", node.node.name());
    }

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_follower_rejects_writes_but_serves_reads() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = start_cluster(dir.path(), 2).await;
    assert_eq!(nodes[0].command("SET a 1").await, "Success");

    let follower = &nodes[1];
    assert!(wait_for_value(&follower.node, "a", "1").await);
    assert!(!follower.node.is_leader());

    for line in ["SET a 2", "DEL a", "JOIN node9 127.0.0.1:1"] {
        let reply = follower.command(line).await;
        assert!(
            reply.starts_with("node is not the leader"),
            "{:?} gave {:?}",
            line,
            reply
        );
    }
    assert_eq!(follower.command("GET a").await, "1");

    let err = follower.node.set("a", "3").await.unwrap_err();
    match err {
        Error::NotLeader { leader } => {
            assert_eq!(leader.as_deref(), Some(nodes[0].node.raft_addr()))
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_rejoin_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = start_cluster(dir.path(), 1).await;
    assert!(wait_for_voters(&nodes[0].node, 2).await);

    let joiner = &nodes[1];
    let line = format!("JOIN {} {}", joiner.node.name(), joiner.node.raft_addr());
    assert_eq!(nodes[0].command(&line).await, "Success");
    assert_eq!(nodes[0].node.voters().len(), 2);

    // The cluster still commits.
    assert_eq!(nodes[0].command("SET after rejoin").await, "Success");
    assert!(wait_for_value(&joiner.node, "after", "rejoin").await);

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_rejoin_with_new_address_keeps_membership() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = start_cluster(dir.path(), 1).await;
    assert!(wait_for_voters(&nodes[0].node, 2).await);

    let joiner = &nodes[1];
    let line = format!("JOIN {} 127.0.0.1:1", joiner.node.name());
    assert_eq!(nodes[0].command(&line).await, "Success");

    let voters = nodes[0].node.voters();
    assert_eq!(voters.len(), 2);
    assert!(
        voters
            .iter()
            .any(|n| n.name == joiner.node.name() && n.addr == joiner.node.raft_addr())
    );

    assert_eq!(nodes[0].command("SET still replicating").await, "Success");
    assert!(wait_for_value(&joiner.node, "still", "replicating").await);

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_joined_node_learns_existing_state() {
    let dir = tempfile::tempdir().unwrap();
    let leader = TestNode::start(&test_config("node0", dir.path(), true), true).await;
    assert!(wait_for_leader(&leader.node, Duration::from_secs(5)).await);

    for i in 0..25 {
        leader
            .node
            .set(&format!("k{}", i), &i.to_string())
            .await
            .unwrap();
    }

    let late = TestNode::start(&test_config("late", dir.path(), true), false).await;
    join_cluster(&leader.cmd_addr, "late", late.node.raft_addr(), 3)
        .await
        .unwrap();

    assert!(wait_for_value(&late.node, "k0", "0").await);
    assert!(late.node.is_initialized());
    assert!(wait_for_value(&late.node, "k24", "24").await);

    late.stop().await;
    leader.stop().await;
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn test_durable_restart_restores_state() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();

    {
        let config = test_config("durable", dir.path(), false);
        let node = RaftNode::open(&config, true).await?;
        assert!(wait_for_leader(&node, Duration::from_secs(5)).await);
        for i in 0..25 {
            node.set(&format!("k{}", i), &format!("v{}", i)).await?;
        }
        node.del("k3").await?;
        node.shutdown().await?;
    }

    assert!(dir.path().join("nodes").exists());

    // Bootstrapping again must not reset the existing cluster.
    let config = test_config("durable", dir.path(), false);
    let node = RaftNode::open(&config, true).await?;
    assert!(wait_for_leader(&node, Duration::from_secs(5)).await);

    assert!(wait_for_value(&node, "k24", "v24").await);
    assert_eq!(node.get("k0").await?, "v0");
    assert!(matches!(node.get("k3").await, Err(Error::NotFound(_))));
    assert_eq!(node.voters().len(), 1);

    node.set("after", "restart").await?;
    assert_eq!(node.get("after").await?, "restart");

    node.shutdown().await
}

#[tokio::test]
async fn test_in_memory_node_leaves_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let raft_dir = dir.path().join("unused");
    let node = RaftNode::open(&test_config("mem", &raft_dir, true), true)
        .await
        .unwrap();
    assert!(wait_for_leader(&node, Duration::from_secs(5)).await);
    node.set("a", "1").await.unwrap();
    node.shutdown().await.unwrap();

    assert!(!raft_dir.exists());
}
