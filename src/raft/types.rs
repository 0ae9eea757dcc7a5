//! Type definitions for the Raft consensus layer.

use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use super::operation::{Operation, OperationResponse};

/// Numeric node ID used by the consensus engine.
pub type RaftNodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Operation,
        R = OperationResponse,
        NodeId = RaftNodeId,
        Node = KvNode,
        SnapshotData = Cursor<Vec<u8>>,
);

/// A cluster member as recorded in the replicated membership.
///
/// Nodes are named by operators with free-form strings; the engine only sees
/// the numeric ID derived by [`raft_node_id`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvNode {
    /// Operator-facing node name (the `JOIN <nodeID>` token).
    pub name: String,
    /// Address of the node's consensus RPC listener.
    pub addr: String,
}

impl KvNode {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

impl fmt::Display for KvNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// IDs at or above this value are derived from a checksum of the node name.
const HASHED_ID_BASE: u64 = 1 << 32;

/// Map a node name to the engine's numeric ID.
///
/// Names that are small integers ("1", "2", ...) keep their value so log
/// output stays readable. Any other name maps into a disjoint range above
/// `u32::MAX` using CRC32C, so the same name always yields the same ID on
/// every node.
pub fn raft_node_id(name: &str) -> RaftNodeId {
    match name.parse::<u32>() {
        Ok(n) => u64::from(n),
        Err(_) => HASHED_ID_BASE + u64::from(crc32c::crc32c(name.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_names_keep_their_value() {
        assert_eq!(raft_node_id("0"), 0);
        assert_eq!(raft_node_id("7"), 7);
        assert_eq!(raft_node_id("4294967295"), u64::from(u32::MAX));
    }

    #[test]
    fn test_string_names_are_stable_and_disjoint() {
        let a = raft_node_id("node0");
        assert_eq!(a, raft_node_id("node0"));
        assert!(a >= HASHED_ID_BASE);
        assert_ne!(a, raft_node_id("node1"));
    }

    #[test]
    fn test_oversized_numeric_names_are_hashed() {
        assert!(raft_node_id("4294967296") >= HASHED_ID_BASE);
        assert!(raft_node_id("-1") >= HASHED_ID_BASE);
    }

    #[test]
    fn test_kv_node_display() {
        let node = KvNode::new("node0", "127.0.0.1:4001");
        assert_eq!(node.to_string(), "node0@127.0.0.1:4001");
    }
}
