//! Process configuration.
//!
//! Every option can be given as a command-line flag or through the matching
//! `RAFTKV_*` environment variable. Durations are written in milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::server::DEFAULT_MAX_CONNECTIONS;

/// Default address for the client command protocol.
pub const DEFAULT_TCP_ADDR: &str = "localhost:3001";

/// Default address for consensus traffic between nodes.
pub const DEFAULT_RAFT_ADDR: &str = "localhost:4001";

/// Configuration for a raftkv node.
#[derive(Debug, Clone, Parser)]
#[command(name = "raftkv", version, about = "Raft-replicated key-value store")]
pub struct NodeConfig {
    /// Keep the Raft log and snapshots in memory only.
    #[arg(long = "in-memory", env = "RAFTKV_IN_MEMORY")]
    pub in_memory: bool,

    /// Bind address for the client command protocol.
    #[arg(long = "tcp-addr", env = "RAFTKV_TCP_ADDR", default_value = DEFAULT_TCP_ADDR)]
    pub tcp_addr: String,

    /// Bind address for Raft traffic; also advertised to peers.
    #[arg(long = "raft-addr", env = "RAFTKV_RAFT_ADDR", default_value = DEFAULT_RAFT_ADDR)]
    pub raft_addr: String,

    /// Command address of an existing member to join through.
    #[arg(long = "join", env = "RAFTKV_JOIN")]
    pub join: Option<String>,

    /// Node name, unique within the cluster.
    #[arg(long = "id", env = "RAFTKV_NODE_ID")]
    pub node_id: String,

    /// Directory for Raft log and snapshot storage.
    #[arg(long = "raft-dir", env = "RAFTKV_RAFT_DIR")]
    pub raft_dir: PathBuf,

    /// Leader heartbeat interval.
    #[arg(long, env = "RAFTKV_HEARTBEAT_MS", default_value = "100", value_parser = parse_millis)]
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout.
    #[arg(long, env = "RAFTKV_ELECTION_MIN_MS", default_value = "200", value_parser = parse_millis)]
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout.
    #[arg(long, env = "RAFTKV_ELECTION_MAX_MS", default_value = "400", value_parser = parse_millis)]
    pub election_timeout_max: Duration,

    /// Build a snapshot after this many applied entries.
    #[arg(long, env = "RAFTKV_SNAPSHOT_THRESHOLD", default_value_t = 1_000)]
    pub snapshot_threshold: u64,

    /// Maximum entries per AppendEntries RPC.
    #[arg(long, env = "RAFTKV_MAX_PAYLOAD_ENTRIES", default_value_t = 300)]
    pub max_payload_entries: u64,

    /// How long SET, DEL and JOIN wait for quorum commitment.
    #[arg(long, env = "RAFTKV_COMMIT_TIMEOUT_MS", default_value = "10000", value_parser = parse_millis)]
    pub commit_timeout: Duration,

    /// Maximum number of writes waiting for commitment at once.
    #[arg(long, env = "RAFTKV_MAX_PENDING_PROPOSALS", default_value_t = 1_000)]
    pub max_pending_proposals: usize,

    /// Maximum concurrently served clients; 0 disables the limit.
    #[arg(long, env = "RAFTKV_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Connection retries for the startup join request.
    #[arg(long, env = "RAFTKV_JOIN_RETRIES", default_value_t = 3)]
    pub join_retries: usize,
}

fn parse_millis(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| format!("invalid milliseconds '{}': {}", s, e))
}

impl NodeConfig {
    /// Build a config with default tuning, for embedding and tests.
    pub fn new(
        node_id: impl Into<String>,
        tcp_addr: impl Into<String>,
        raft_addr: impl Into<String>,
        raft_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            in_memory: false,
            tcp_addr: tcp_addr.into(),
            raft_addr: raft_addr.into(),
            join: None,
            node_id: node_id.into(),
            raft_dir: raft_dir.into(),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(400),
            snapshot_threshold: 1_000,
            max_payload_entries: 300,
            commit_timeout: Duration::from_secs(10),
            max_pending_proposals: 1_000,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            join_retries: 3,
        }
    }

    /// Whether this node forms a new cluster rather than joining one.
    pub fn bootstrap(&self) -> bool {
        self.join.is_none()
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node_id.trim().is_empty() {
            errors.push("node id must not be empty".to_string());
        } else if self.node_id.split_whitespace().count() != 1 {
            errors.push(format!(
                "node id '{}' must be a single token without whitespace",
                self.node_id
            ));
        }

        if self.raft_dir.as_os_str().is_empty() {
            errors.push("raft directory must be specified".to_string());
        }

        if self.raft_addr.split_whitespace().count() != 1 {
            errors.push(format!(
                "raft address '{}' must be a single token without whitespace",
                self.raft_addr
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be less than election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            errors.push(format!(
                "heartbeat_interval ({:?}) should be much less than election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.commit_timeout.is_zero() {
            errors.push("commit_timeout must be greater than zero".to_string());
        }

        if self.max_pending_proposals == 0 {
            errors.push("max_pending_proposals must be greater than zero".to_string());
        }

        if self.snapshot_threshold == 0 {
            errors.push("snapshot_threshold must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Build the consensus engine configuration.
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "raftkv".to_string(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            max_payload_entries: self.max_payload_entries,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
    }
}
