//! Raft storage implementation using openraft's RaftStorage trait (v1 API).
//!
//! The log, the vote and the snapshots are kept in memory for reads and
//! written through to an object store. Durable nodes use a local filesystem
//! store under the configured Raft directory; transient nodes use an
//! in-memory store, so nothing survives a restart.
//!
//! Object layout under the node prefix:
//!
//! ```text
//! <prefix>/vote                       bincode Vote
//! <prefix>/purged                     bincode LogId of the last purged entry
//! <prefix>/log/<index:020>            bincode Entry
//! <prefix>/snapshot/current.snapshot  JSON key-value map
//! <prefix>/snapshot/current.meta      bincode SnapshotMetadata (commit marker)
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftStorage, Snapshot,
    SnapshotMeta, StorageError, StoredMembership, Vote,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::operation::OperationResponse;
use super::state_machine::KvStateMachine;
use super::types::{KvNode, RaftNodeId, TypeConfig};
use crate::error::{Error, Result};

/// Snapshot metadata stored alongside the snapshot data.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotMetadata {
    last_log_id: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, KvNode>,
    snapshot_id: String,
}

/// Persisted snapshot data (cached in memory).
#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<RaftNodeId, KvNode>,
    data: Vec<u8>,
}

/// Open the object store backing a node's Raft state.
///
/// `in_memory` selects transient storage; otherwise `raft_dir` is created if
/// needed and used as the root of a local filesystem store.
pub fn open_object_store(in_memory: bool, raft_dir: &Path) -> Result<Arc<dyn ObjectStore>> {
    if in_memory {
        return Ok(Arc::new(InMemory::new()));
    }

    std::fs::create_dir_all(raft_dir).map_err(|e| {
        Error::StorageInit(format!(
            "failed to create raft directory {}: {}",
            raft_dir.display(),
            e
        ))
    })?;

    let store = LocalFileSystem::new_with_prefix(raft_dir)
        .map_err(|e| Error::StorageInit(format!("failed to open raft directory: {}", e)))?;
    Ok(Arc::new(store))
}

fn io_error(
    subject: ErrorSubject<RaftNodeId>,
    verb: ErrorVerb,
    e: impl ToString,
) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(subject, verb, std::io::Error::other(e.to_string()))
}

fn corruption(subject: ErrorSubject<RaftNodeId>, msg: String) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        subject,
        ErrorVerb::Read,
        std::io::Error::new(std::io::ErrorKind::InvalidData, msg),
    )
}

/// Combined log and state machine storage for Raft.
#[derive(Clone)]
pub struct RaftStore {
    vote: Arc<RwLock<Option<Vote<RaftNodeId>>>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    sm: Arc<KvStateMachine>,
    /// Also serializes applies against snapshot builds.
    last_applied_log: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<RaftNodeId, KvNode>>>,
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl RaftStore {
    /// Create a store writing under `prefix` (e.g. "nodes/node0").
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            sm: Arc::new(KvStateMachine::new()),
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            object_store,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The state machine, for local reads.
    pub fn state_machine(&self) -> Arc<KvStateMachine> {
        self.sm.clone()
    }

    fn path(&self, suffix: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", self.prefix, suffix))
    }

    fn log_path(&self, index: u64) -> ObjectPath {
        self.path(&format!("log/{:020}", index))
    }

    async fn put_bincode<T: Serialize>(
        &self,
        path: &ObjectPath,
        value: &T,
        subject: ErrorSubject<RaftNodeId>,
    ) -> std::result::Result<(), StorageError<RaftNodeId>> {
        let bytes = bincode::serialize(value)
            .map_err(|e| io_error(subject.clone(), ErrorVerb::Write, e))?;
        self.object_store
            .put(path, Bytes::from(bytes).into())
            .await
            .map_err(|e| {
                error!(error = %e, path = %path, "Failed to write raft state");
                io_error(subject, ErrorVerb::Write, e)
            })?;
        Ok(())
    }

    /// Read and decode an object. `Ok(None)` means it does not exist.
    async fn get_bincode<T: DeserializeOwned>(
        &self,
        path: &ObjectPath,
        subject: ErrorSubject<RaftNodeId>,
    ) -> std::result::Result<Option<T>, StorageError<RaftNodeId>> {
        let bytes = match self.object_store.get(path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| io_error(subject.clone(), ErrorVerb::Read, e))?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(io_error(subject, ErrorVerb::Read, e)),
        };

        let value = bincode::deserialize(&bytes).map_err(|e| {
            error!(error = %e, path = %path, "CORRUPTION: failed to decode raft state");
            corruption(subject, format!("{} is corrupted: {}", path, e))
        })?;
        Ok(Some(value))
    }

    async fn delete_quietly(&self, path: &ObjectPath) {
        if let Err(e) = self.object_store.delete(path).await {
            debug!(error = %e, path = %path, "Failed to delete object (may already be gone)");
        }
    }

    /// Load everything previously persisted for this node.
    ///
    /// Returns `true` if any prior state was found. Corrupt snapshots or log
    /// entries are errors: starting from partial state could diverge from
    /// the rest of the cluster.
    pub async fn load_from_store(&self) -> std::result::Result<bool, StorageError<RaftNodeId>> {
        let restored_snapshot = self.load_snapshot_from_store().await?;

        let vote: Option<Vote<RaftNodeId>> =
            self.get_bincode(&self.path("vote"), ErrorSubject::Vote).await?;
        let purged: Option<LogId<RaftNodeId>> =
            self.get_bincode(&self.path("purged"), ErrorSubject::Logs).await?;

        let mut entry_paths = Vec::new();
        let log_prefix = self.path("log");
        let mut listing = self.object_store.list(Some(&log_prefix));
        while let Some(item) = listing.next().await {
            let meta = item.map_err(|e| io_error(ErrorSubject::Logs, ErrorVerb::Read, e))?;
            entry_paths.push(meta.location);
        }

        let mut log = BTreeMap::new();
        for path in entry_paths {
            let Some(entry) = self
                .get_bincode::<Entry<TypeConfig>>(&path, ErrorSubject::Logs)
                .await?
            else {
                continue;
            };
            // Leftovers of an interrupted purge.
            if purged.is_some_and(|p| entry.log_id.index <= p.index) {
                self.delete_quietly(&path).await;
                continue;
            }
            log.insert(entry.log_id.index, entry);
        }

        let found = restored_snapshot || vote.is_some() || !log.is_empty();
        info!(
            prefix = %self.prefix,
            restored_snapshot,
            has_vote = vote.is_some(),
            log_entries = log.len(),
            last_purged = ?purged.map(|l| l.index),
            "Loaded raft state from object store"
        );

        *self.vote.write().await = vote;
        *self.last_purged_log_id.write().await = purged;
        *self.log.write().await = log;
        Ok(found)
    }

    /// Load the latest snapshot, if any, into the state machine.
    ///
    /// Also cleans up orphaned temp files from crashed snapshot writes.
    async fn load_snapshot_from_store(&self) -> std::result::Result<bool, StorageError<RaftNodeId>> {
        self.cleanup_temp_files().await;

        let data_path = self.path("snapshot/current.snapshot");
        let meta_path = self.path("snapshot/current.meta");

        let Some(metadata) = self
            .get_bincode::<SnapshotMetadata>(&meta_path, ErrorSubject::Snapshot(None))
            .await?
        else {
            debug!("No existing snapshot found in object store (clean start)");
            return Ok(false);
        };

        let data = match self.object_store.get(&data_path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| {
                    corruption(
                        ErrorSubject::Snapshot(None),
                        format!("snapshot data unreadable: {}", e),
                    )
                })?
                .to_vec(),
            Err(object_store::Error::NotFound { .. }) => {
                error!(
                    meta_path = %meta_path,
                    data_path = %data_path,
                    snapshot_id = %metadata.snapshot_id,
                    "CORRUPTION: Snapshot metadata exists but data file is missing"
                );
                return Err(corruption(
                    ErrorSubject::Snapshot(None),
                    "snapshot metadata exists but data file is missing".to_string(),
                ));
            }
            Err(e) => {
                return Err(io_error(
                    ErrorSubject::Snapshot(None),
                    ErrorVerb::Read,
                    e,
                ));
            }
        };

        self.sm.restore(&data).await.map_err(|e| {
            error!(error = %e, "CORRUPTION: Snapshot data is not a valid key-value map");
            corruption(
                ErrorSubject::Snapshot(None),
                format!("snapshot data corrupted: {}", e),
            )
        })?;
        *self.last_applied_log.write().await = metadata.last_log_id;
        *self.last_membership.write().await = metadata.last_membership.clone();

        let meta = SnapshotMeta {
            last_log_id: metadata.last_log_id,
            last_membership: metadata.last_membership,
            snapshot_id: metadata.snapshot_id,
        };
        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Restored snapshot from object store"
        );
        *self.cached_snapshot.write().await = Some(CachedSnapshot { meta, data });

        Ok(true)
    }

    /// Delete `temp-*` files left behind by crashed snapshot writes.
    async fn cleanup_temp_files(&self) {
        let prefix = self.path("snapshot");
        let mut listing = self.object_store.list(Some(&prefix));
        let mut temp_files = Vec::new();

        while let Some(result) = listing.next().await {
            match result {
                Ok(meta) => {
                    if meta
                        .location
                        .filename()
                        .is_some_and(|name| name.starts_with("temp-"))
                    {
                        temp_files.push(meta.location);
                    }
                }
                Err(e) => debug!(error = %e, "Error listing files during temp cleanup"),
            }
        }

        for path in temp_files {
            self.delete_quietly(&path).await;
            info!(path = %path, "Cleaned up orphaned temp snapshot file");
        }
    }

    /// Move `from` to `to`, falling back to copy+delete where rename is unsupported.
    async fn promote(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> std::result::Result<(), StorageError<RaftNodeId>> {
        if let Err(e) = self.object_store.rename(from, to).await {
            self.object_store.copy(from, to).await.map_err(|copy_err| {
                error!(error = %copy_err, from = %from, to = %to, "Failed to promote snapshot file");
                io_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, copy_err)
            })?;
            self.delete_quietly(from).await;
            debug!(error = %e, "Used copy+delete fallback (rename not supported)");
        }
        Ok(())
    }

    /// Persist a snapshot.
    ///
    /// Data and metadata are written to temp paths and then promoted, data
    /// first. The metadata file is the commit marker: until it is promoted
    /// the previous snapshot stays valid.
    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<RaftNodeId, KvNode>,
        data: &[u8],
    ) -> std::result::Result<(), StorageError<RaftNodeId>> {
        let temp_data = self.path(&format!("snapshot/temp-{}.snapshot", meta.snapshot_id));
        let temp_meta = self.path(&format!("snapshot/temp-{}.meta", meta.snapshot_id));
        let final_data = self.path("snapshot/current.snapshot");
        let final_meta = self.path("snapshot/current.meta");

        let metadata = SnapshotMetadata {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };

        self.object_store
            .put(&temp_data, Bytes::copy_from_slice(data).into())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to write snapshot data to temp path");
                io_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, e)
            })?;

        if let Err(e) = self
            .put_bincode(&temp_meta, &metadata, ErrorSubject::Snapshot(None))
            .await
        {
            self.delete_quietly(&temp_data).await;
            return Err(e);
        }

        if let Err(e) = self.promote(&temp_data, &final_data).await {
            self.delete_quietly(&temp_data).await;
            self.delete_quietly(&temp_meta).await;
            return Err(e);
        }
        if let Err(e) = self.promote(&temp_meta, &final_meta).await {
            self.delete_quietly(&temp_meta).await;
            return Err(e);
        }

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            size_bytes = data.len(),
            "Persisted snapshot to object store"
        );
        Ok(())
    }

    async fn remove_log_entries(&self, indexes: Vec<u64>) {
        let mut log = self.log.write().await;
        for index in indexes {
            log.remove(&index);
            self.delete_quietly(&self.log_path(index)).await;
        }
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<RaftNodeId>,
    ) -> std::result::Result<(), StorageError<RaftNodeId>> {
        self.put_bincode(&self.path("vote"), vote, ErrorSubject::Vote)
            .await?;
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(
        &mut self,
    ) -> std::result::Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> std::result::Result<openraft::storage::LogState<TypeConfig>, StorageError<RaftNodeId>>
    {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log.values().last().map(|e| e.log_id).or(last_purged);

        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(
        &mut self,
        entries: I,
    ) -> std::result::Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        for entry in entries {
            let path = self.log_path(entry.log_id.index);
            self.put_bincode(&path, &entry, ErrorSubject::Logs).await?;
            self.log.write().await.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> std::result::Result<(), StorageError<RaftNodeId>> {
        let indexes: Vec<u64> = self
            .log
            .read()
            .await
            .range(log_id.index..)
            .map(|(k, _)| *k)
            .collect();
        debug!(from_index = log_id.index, count = indexes.len(), "Deleting conflicting log entries");
        self.remove_log_entries(indexes).await;
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> std::result::Result<(), StorageError<RaftNodeId>> {
        self.put_bincode(&self.path("purged"), &log_id, ErrorSubject::Logs)
            .await?;
        *self.last_purged_log_id.write().await = Some(log_id);

        let indexes: Vec<u64> = self
            .log
            .read()
            .await
            .range(..=log_id.index)
            .map(|(k, _)| *k)
            .collect();
        self.remove_log_entries(indexes).await;
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> std::result::Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, KvNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> std::result::Result<Vec<OperationResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        let mut last_applied = self.last_applied_log.write().await;

        for entry in entries {
            *last_applied = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => responses.push(OperationResponse::default()),
                EntryPayload::Normal(operation) => {
                    responses.push(self.sm.apply(operation).await);
                }
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    responses.push(OperationResponse::default());
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, KvNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<RaftNodeId>> {
        let data = snapshot.into_inner();

        {
            let mut last_applied = self.last_applied_log.write().await;
            self.sm.restore(&data).await.map_err(|e| {
                warn!(error = %e, snapshot_id = %meta.snapshot_id, "Received an undecodable snapshot");
                corruption(
                    ErrorSubject::Snapshot(None),
                    format!("snapshot data corrupted: {}", e),
                )
            })?;
            *last_applied = meta.last_log_id;
            *self.last_membership.write().await = meta.last_membership.clone();
        }

        self.persist_snapshot(meta, &data).await?;
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Installed snapshot from leader"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        Ok(self
            .cached_snapshot
            .read()
            .await
            .as_ref()
            .map(|cached| Snapshot {
                meta: cached.meta.clone(),
                snapshot: Box::new(Cursor::new(cached.data.clone())),
            }))
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(
        &mut self,
    ) -> std::result::Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        // Holding last_applied keeps data and metadata from the same log position.
        let (data, last_applied, membership) = {
            let last_applied = self.last_applied_log.read().await;
            let data = self
                .sm
                .snapshot()
                .await
                .map_err(|e| io_error(ErrorSubject::StateMachine, ErrorVerb::Write, e))?;
            let membership = self.last_membership.read().await.clone();
            (data, *last_applied, membership)
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: format!("snapshot-{}", last_applied.map(|l| l.index).unwrap_or(0)),
        };

        self.persist_snapshot(&meta, &data).await?;
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}
