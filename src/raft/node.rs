//! Consensus coordinator.
//!
//! [`RaftNode`] binds the key-value state machine to an openraft instance and
//! exposes get/set/del/join over it. Writes and membership changes are only
//! accepted on the leader; reads are served from local state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::storage::Adaptor;
use openraft::{Raft, RaftMetrics};
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::network::{RaftNetworkFactoryImpl, RaftRpcServer};
use super::operation::{Operation, OperationResponse};
use super::state_machine::KvStateMachine;
use super::storage::{RaftStore, open_object_store};
use super::types::{KvNode, RaftNodeId, TypeConfig, raft_node_id};
use crate::config::NodeConfig;
use crate::error::{Error, Result};

/// A member of a replicated key-value cluster.
pub struct RaftNode {
    raft: Arc<Raft<TypeConfig>>,
    state_machine: Arc<KvStateMachine>,
    node_id: RaftNodeId,
    name: String,
    /// Address advertised to peers for consensus traffic.
    raft_addr: String,
    commit_timeout: Duration,
    /// Bounds the number of writes waiting on commitment.
    proposals: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RaftNode {
    /// Open local storage, start the peer RPC listener and the consensus engine.
    ///
    /// With `bootstrap` set, a node with no prior membership forms a new
    /// single-voter cluster. Otherwise it waits for a leader to add it.
    pub async fn open(config: &NodeConfig, bootstrap: bool) -> Result<Self> {
        if let Err(errors) = config.validate() {
            return Err(Error::Config(format!(
                "invalid node config: {}",
                errors.join(", ")
            )));
        }

        let name = config.node_id.clone();
        let node_id = raft_node_id(&name);

        let object_store = open_object_store(config.in_memory, &config.raft_dir)?;
        let store = RaftStore::new(object_store, &format!("nodes/{}", name));
        let restored = store
            .load_from_store()
            .await
            .map_err(|e| Error::StorageInit(format!("failed to load raft state: {}", e)))?;
        if restored {
            info!(node = %name, "Restored raft state from storage");
        }
        let state_machine = store.state_machine();

        let raft_config = config
            .to_openraft_config()
            .validate()
            .map_err(|e| Error::Config(format!("invalid raft config: {}", e)))?;

        let listener = TcpListener::bind(&config.raft_addr).await.map_err(|e| {
            Error::StorageInit(format!(
                "failed to bind raft address {}: {}",
                config.raft_addr, e
            ))
        })?;
        let raft_addr = advertised_addr(&config.raft_addr, &listener);

        let (log_store, sm_store) = Adaptor::new(store);
        let raft = Raft::new(
            node_id,
            Arc::new(raft_config),
            RaftNetworkFactoryImpl,
            log_store,
            sm_store,
        )
        .await
        .map_err(|e| Error::StorageInit(format!("failed to start raft: {}", e)))?;
        let raft = Arc::new(raft);

        let (shutdown_tx, _) = broadcast::channel(1);
        let rpc_server = RaftRpcServer::new(raft.clone(), listener);
        tokio::spawn(rpc_server.run(shutdown_tx.subscribe()));

        let node = Self {
            raft,
            state_machine,
            node_id,
            name,
            raft_addr,
            commit_timeout: config.commit_timeout,
            proposals: Arc::new(Semaphore::new(config.max_pending_proposals)),
            shutdown_tx,
        };

        if bootstrap {
            node.initialize().await?;
        }

        info!(
            node = %node.name,
            node_id = node.node_id,
            raft_addr = %node.raft_addr,
            bootstrap,
            in_memory = config.in_memory,
            "Raft node started"
        );
        Ok(node)
    }

    /// Form a single-voter cluster, unless membership already exists.
    async fn initialize(&self) -> Result<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            KvNode::new(self.name.clone(), self.raft_addr.clone()),
        );

        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(node = %self.name, "Bootstrapped single-node cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                info!(node = %self.name, "Existing cluster state found, skipping bootstrap");
                Ok(())
            }
            Err(e) => {
                let _ = self.shutdown_tx.send(());
                let _ = self.raft.shutdown().await;
                Err(Error::StorageInit(format!(
                    "failed to initialize cluster: {}",
                    e
                )))
            }
        }
    }

    /// Read a key from the local state machine.
    ///
    /// This does not consult the leader, so a lagging node may return
    /// stale data.
    pub async fn get(&self, key: &str) -> Result<String> {
        self.state_machine
            .get(key)
            .await
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Replicate a SET and wait for it to commit.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.propose(Operation::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Replicate a DEL and wait for it to commit. Deleting an absent key succeeds.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.propose(Operation::Delete {
            key: key.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn propose(&self, operation: Operation) -> Result<OperationResponse> {
        self.ensure_leader()?;

        let commit_timeout = self.commit_timeout;
        timeout(commit_timeout, async {
            let _permit = self
                .proposals
                .acquire()
                .await
                .map_err(|_| Error::Raft("proposal queue closed".to_string()))?;

            debug!(node = %self.name, operation = %operation, "Proposing operation");
            match self.raft.client_write(operation).await {
                Ok(resp) => Ok(resp.data),
                Err(RaftError::APIError(ClientWriteError::ForwardToLeader(f))) => {
                    Err(Error::NotLeader {
                        leader: f.leader_node.map(|n| n.addr),
                    })
                }
                Err(e) => Err(Error::Raft(format!("write failed: {}", e))),
            }
        })
        .await
        .map_err(|_| {
            warn!(node = %self.name, timeout = ?commit_timeout, "Proposal timed out");
            Error::CommitTimeout(commit_timeout)
        })?
    }

    /// Admit a node as a voter. Joining a node that is already a voter succeeds.
    pub async fn join(&self, name: &str, addr: &str) -> Result<()> {
        self.ensure_leader()?;

        let joiner_id = raft_node_id(name);
        let joiner = KvNode::new(name, addr);

        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        let mut voters: BTreeSet<RaftNodeId> = membership.voter_ids().collect();
        let existing = membership
            .nodes()
            .find(|(id, _)| **id == joiner_id)
            .map(|(_, node)| node.clone());

        if voters.contains(&joiner_id) && existing.as_ref() == Some(&joiner) {
            info!(node = %joiner, "Node is already a voter, ignoring join request");
            return Ok(());
        }
        if let Some(existing) = existing.filter(|n| n.addr != joiner.addr) {
            warn!(
                node = %name,
                old_addr = %existing.addr,
                new_addr = %addr,
                "Rejoining node has changed address"
            );
        }

        let commit_timeout = self.commit_timeout;
        timeout(commit_timeout, async {
            // A node already in the membership keeps its recorded entry.
            match self.raft.add_learner(joiner_id, joiner.clone(), true).await {
                Ok(_) => debug!(node = %joiner, "Added learner"),
                Err(RaftError::APIError(ClientWriteError::ForwardToLeader(f))) => {
                    return Err(Error::NotLeader {
                        leader: f.leader_node.map(|n| n.addr),
                    });
                }
                Err(e) => return Err(Error::Raft(format!("failed to add learner: {}", e))),
            }

            voters.insert(joiner_id);
            match self.raft.change_membership(voters, false).await {
                Ok(_) => Ok(()),
                Err(RaftError::APIError(ClientWriteError::ForwardToLeader(f))) => {
                    Err(Error::NotLeader {
                        leader: f.leader_node.map(|n| n.addr),
                    })
                }
                Err(e) => Err(Error::Raft(format!("failed to change membership: {}", e))),
            }
        })
        .await
        .map_err(|_| Error::CommitTimeout(commit_timeout))??;

        info!(node = %joiner, node_id = joiner_id, "Node joined cluster as voter");
        Ok(())
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader {
                leader: self.current_leader().map(|n| n.addr),
            })
        }
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// The leader as recorded in the replicated membership, if known.
    pub fn current_leader(&self) -> Option<KvNode> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let leader_id = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(id, _)| **id == leader_id)
            .map(|(_, node)| node.clone())
    }

    /// Current voters, ordered by node ID.
    pub fn voters(&self) -> Vec<KvNode> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let membership = metrics.membership_config.membership();
        let voter_ids: BTreeSet<RaftNodeId> = membership.voter_ids().collect();
        membership
            .nodes()
            .filter(|(id, _)| voter_ids.contains(id))
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// Whether this node has any membership, either bootstrapped or joined.
    pub fn is_initialized(&self) -> bool {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics
            .membership_config
            .membership()
            .voter_ids()
            .next()
            .is_some()
    }

    pub fn metrics(&self) -> RaftMetrics<RaftNodeId, KvNode> {
        self.raft.metrics().borrow().clone()
    }

    pub fn node_id(&self) -> RaftNodeId {
        self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address peers use to reach this node's consensus listener.
    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    /// The state machine, for local reads.
    pub fn state_machine(&self) -> Arc<KvStateMachine> {
        self.state_machine.clone()
    }

    /// Stop the RPC listener and the consensus engine.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.proposals.close();
        self.raft
            .shutdown()
            .await
            .map_err(|e| Error::Raft(format!("failed to shut down raft: {}", e)))?;
        info!(node = %self.name, "Raft node shut down");
        Ok(())
    }
}

/// Use the bound address when the configured port is 0.
fn advertised_addr(configured: &str, listener: &TcpListener) -> String {
    if configured.ends_with(":0")
        && let Ok(local) = listener.local_addr()
    {
        return local.to_string();
    }
    configured.to_string()
}

#[async_trait::async_trait]
impl crate::store::Store for RaftNode {
    async fn get(&self, key: &str) -> Result<String> {
        RaftNode::get(self, key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        RaftNode::set(self, key, value).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        RaftNode::del(self, key).await
    }

    async fn join(&self, node_id: &str, addr: &str) -> Result<()> {
        RaftNode::join(self, node_id, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(name: &str) -> NodeConfig {
        let mut config = NodeConfig::new(name, "127.0.0.1:0", "127.0.0.1:0", "unused");
        config.in_memory = true;
        config.heartbeat_interval = Duration::from_millis(50);
        config.election_timeout_min = Duration::from_millis(150);
        config.election_timeout_max = Duration::from_millis(300);
        config.commit_timeout = Duration::from_secs(5);
        config
    }

    async fn wait_for_leader(node: &RaftNode) {
        for _ in 0..100 {
            if node.is_leader() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("node {} never became leader", node.name());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut config = fast_config("n");
        config.commit_timeout = Duration::ZERO;
        let err = RaftNode::open(&config, true).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_advertises_bound_port() {
        let node = RaftNode::open(&fast_config("adv"), false).await.unwrap();
        assert!(!node.raft_addr().ends_with(":0"));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_then_set_get_del() {
        let node = RaftNode::open(&fast_config("solo"), true).await.unwrap();
        wait_for_leader(&node).await;
        assert!(node.is_initialized());
        assert_eq!(node.voters().len(), 1);
        assert_eq!(node.current_leader().unwrap().name, "solo");

        node.set("a", "1").await.unwrap();
        assert_eq!(node.get("a").await.unwrap(), "1");

        node.del("a").await.unwrap();
        assert!(matches!(node.get("a").await, Err(Error::NotFound(k)) if k == "a"));

        // Deleting an absent key still commits.
        node.del("missing").await.unwrap();

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_uninitialized_node_rejects_writes() {
        let node = RaftNode::open(&fast_config("waiting"), false).await.unwrap();
        assert!(!node.is_initialized());
        assert!(!node.is_leader());

        let err = node.set("a", "1").await.unwrap_err();
        assert!(matches!(err, Error::NotLeader { leader: None }));
        let err = node.join("other", "127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_self_is_idempotent() {
        let node = RaftNode::open(&fast_config("leader"), true).await.unwrap();
        wait_for_leader(&node).await;

        let addr = node.raft_addr().to_string();
        node.join("leader", &addr).await.unwrap();
        assert_eq!(node.voters().len(), 1);

        node.shutdown().await.unwrap();
    }
}
