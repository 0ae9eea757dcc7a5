//! # raftkv
//! A strongly consistent key-value store replicated with Raft.
//!
//! Each node keeps a full copy of a string-to-string map. Writes go through
//! the Raft leader and are acknowledged once a quorum has committed them;
//! reads are served from the local copy. Clients talk to any node over a
//! newline-delimited TCP protocol:
//!
//! ```text
//! SET greeting hello      -> Success
//! GET greeting            -> hello
//! DEL greeting            -> Success
//! JOIN node1 host:4002    -> Success
//! ```
//!
//! ## Running a node
//! ```rust,no_run
//! use std::sync::Arc;
//! use raftkv::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> raftkv::Result<()> {
//!     let config = NodeConfig::new("node0", "127.0.0.1:3001", "127.0.0.1:4001", "/tmp/node0");
//!     let node = Arc::new(RaftNode::open(&config, config.bootstrap()).await?);
//!
//!     let server = CommandServer::new(&config.tcp_addr, node.clone()).await?;
//!     server.run().await
//! }
//! ```
//!
//! A second node starts with `--join 127.0.0.1:3001` and is admitted as a
//! voter by the leader; see [`join::join_cluster`].

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod join;
pub mod raft;
pub mod server;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};

pub mod prelude {
    //! Commonly used types.
    pub use crate::config::NodeConfig;
    pub use crate::error::{Error, Result};
    pub use crate::join::join_cluster;
    pub use crate::raft::{KvNode, RaftNode};
    pub use crate::server::{Command, CommandServer, ProtocolError};
    pub use crate::store::Store;

    #[cfg(any(test, feature = "test-utilities"))]
    pub use crate::store::MemoryStore;
}
