//! Replicated key-value state machine.
//!
//! The state machine owns the authoritative map. It is only ever mutated by
//! applying committed [`Operation`]s (or by restoring a snapshot), and it has
//! no knowledge of the node that drives it.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use super::operation::{Operation, OperationResponse};

/// The replicated key-value map.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: RwLock<HashMap<String, String>>,
}

impl KvStateMachine {
    /// Create an empty state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a committed operation.
    pub async fn apply(&self, operation: &Operation) -> OperationResponse {
        let mut data = self.data.write().await;
        let previous = match operation {
            Operation::Set { key, value } => data.insert(key.clone(), value.clone()),
            Operation::Delete { key } => data.remove(key),
        };
        debug!(operation = %operation, "Applied operation");
        OperationResponse { previous }
    }

    /// Read a key from local state.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.data.read().await.get(key).cloned()
    }

    /// Serialize a point-in-time copy of the map as a JSON object.
    ///
    /// The shared lock is held only while copying; encoding runs on the copy.
    pub async fn snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        let copy = self.data.read().await.clone();
        serde_json::to_vec(&copy)
    }

    /// Replace the live map with a snapshot produced by [`snapshot`](Self::snapshot).
    ///
    /// On a decode error the live map is left as it was.
    pub async fn restore(&self, snapshot: &[u8]) -> Result<(), serde_json::Error> {
        let restored: HashMap<String, String> = if snapshot.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_slice(snapshot)?
        };
        debug!(keys = restored.len(), "Restoring state machine from snapshot");
        *self.data.write().await = restored;
        Ok(())
    }
}
