//! The operations the command server dispatches to.
//!
//! [`RaftNode`](crate::raft::RaftNode) is the production implementation.
//! [`MemoryStore`] is a single-process stand-in for protocol tests, available
//! in unit tests or with the `test-utilities` feature:
//!
//! ```toml
//! [dev-dependencies]
//! raftkv = { path = ".", features = ["test-utilities"] }
//! ```

use async_trait::async_trait;

use crate::error::Result;

/// Key-value and membership operations exposed to clients.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a key. A missing key is [`Error::NotFound`](crate::Error::NotFound).
    async fn get(&self, key: &str) -> Result<String>;

    /// Set a key once the write is committed.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key once the delete is committed.
    async fn del(&self, key: &str) -> Result<()>;

    /// Admit `node_id`, reachable for consensus traffic at `addr`, as a voter.
    async fn join(&self, node_id: &str, addr: &str) -> Result<()>;
}

#[cfg(any(test, feature = "test-utilities"))]
pub use memory::MemoryStore;

#[cfg(any(test, feature = "test-utilities"))]
mod memory {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::RwLock;

    use super::Store;
    use crate::error::{Error, Result};

    /// In-memory [`Store`] that behaves like a single-node leader.
    ///
    /// Call [`set_leader`](MemoryStore::set_leader) with `false` to make
    /// writes and joins fail the way a follower's do.
    #[derive(Debug)]
    pub struct MemoryStore {
        data: RwLock<HashMap<String, String>>,
        members: RwLock<BTreeMap<String, String>>,
        leader: AtomicBool,
        leader_addr: Option<String>,
    }

    impl Default for MemoryStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self {
                data: RwLock::new(HashMap::new()),
                members: RwLock::new(BTreeMap::new()),
                leader: AtomicBool::new(true),
                leader_addr: None,
            }
        }

        /// A store acting as a follower of the leader at `leader_addr`.
        pub fn follower_of(leader_addr: impl Into<String>) -> Self {
            let store = Self {
                leader_addr: Some(leader_addr.into()),
                ..Self::new()
            };
            store.set_leader(false);
            store
        }

        pub fn set_leader(&self, leader: bool) {
            self.leader.store(leader, Ordering::SeqCst);
        }

        /// Members admitted through [`Store::join`], name to address.
        pub async fn members(&self) -> BTreeMap<String, String> {
            self.members.read().await.clone()
        }

        fn ensure_leader(&self) -> Result<()> {
            if self.leader.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::NotLeader {
                    leader: self.leader_addr.clone(),
                })
            }
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn get(&self, key: &str) -> Result<String> {
            self.data
                .read()
                .await
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NotFound(key.to_string()))
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.ensure_leader()?;
            self.data
                .write()
                .await
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<()> {
            self.ensure_leader()?;
            self.data.write().await.remove(key);
            Ok(())
        }

        async fn join(&self, node_id: &str, addr: &str) -> Result<()> {
            self.ensure_leader()?;
            self.members
                .write()
                .await
                .insert(node_id.to_string(), addr.to_string());
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_leader_accepts_writes() {
            let store = MemoryStore::new();
            store.set("a", "1").await.unwrap();
            assert_eq!(store.get("a").await.unwrap(), "1");
            store.del("a").await.unwrap();
            assert!(matches!(store.get("a").await, Err(Error::NotFound(_))));
        }

        #[tokio::test]
        async fn test_follower_rejects_writes_but_serves_reads() {
            let store = MemoryStore::new();
            store.set("a", "1").await.unwrap();
            store.set_leader(false);

            assert!(matches!(
                store.set("b", "2").await,
                Err(Error::NotLeader { leader: None })
            ));
            assert!(store.join("n1", "127.0.0.1:4002").await.is_err());
            assert_eq!(store.get("a").await.unwrap(), "1");
        }

        #[tokio::test]
        async fn test_follower_of_reports_leader() {
            let store = MemoryStore::follower_of("10.0.0.1:4001");
            match store.del("a").await {
                Err(Error::NotLeader { leader }) => {
                    assert_eq!(leader.as_deref(), Some("10.0.0.1:4001"))
                }
                other => panic!("expected NotLeader, got {:?}", other),
            }
        }
    }
}
