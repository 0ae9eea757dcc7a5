//! Raft consensus layer for the key-value store.
//!
//! Every node runs an embedded openraft instance. Committed [`Operation`]s
//! are applied to the [`KvStateMachine`]; the log, vote and snapshots are
//! kept in an object store (in memory or on local disk).
//!
//! ```text
//!   client ──► CommandServer ──► RaftNode ──► openraft ──► KvStateMachine
//!                                   │            ▲
//!                                   ▼            │
//!                               RaftStore    peer RPC (TCP)
//! ```
//!
//! ```rust,no_run
//! use raftkv::config::NodeConfig;
//! use raftkv::raft::RaftNode;
//!
//! #[tokio::main]
//! async fn main() -> raftkv::Result<()> {
//!     let config = NodeConfig::new("node0", "localhost:3001", "localhost:4001", "/tmp/node0");
//!     let node = RaftNode::open(&config, true).await?;
//!     node.set("greeting", "hello").await?;
//!     node.shutdown().await
//! }
//! ```

mod network;
mod node;
mod operation;
mod state_machine;
mod storage;
mod types;

pub use network::{RaftNetworkFactoryImpl, RaftRpcMessage, RaftRpcResponse, RaftRpcServer};
pub use node::RaftNode;
pub use operation::{Operation, OperationResponse};
pub use state_machine::KvStateMachine;
pub use storage::{RaftStore, open_object_store};
pub use types::{KvNode, RaftNodeId, TypeConfig, raft_node_id};
