//! Replicated operations and their results.
//!
//! An [`Operation`] is the unit of replication: it is carried verbatim as the
//! payload of one Raft log entry and applied to every node's state machine in
//! log order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A mutation of the key-value map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    /// Insert or overwrite `key`.
    Set { key: String, value: String },
    /// Remove `key` if present.
    Delete { key: String },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Set { key, value } => write!(f, "SET {key} {value}"),
            Operation::Delete { key } => write!(f, "DEL {key}"),
        }
    }
}

/// Result of applying one log entry.
///
/// Writers only wait for this to know the entry was applied; the previous
/// value is informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationResponse {
    /// Value held by the key before the operation, if any.
    pub previous: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_display_matches_wire_form() {
        let set = Operation::Set {
            key: "a".into(),
            value: "1".into(),
        };
        assert_eq!(set.to_string(), "SET a 1");
        assert_eq!(Operation::Delete { key: "a".into() }.to_string(), "DEL a");
    }

    #[test]
    fn test_operation_survives_bincode() {
        // Log entries are persisted and shipped to peers with bincode.
        let op = Operation::Set {
            key: "key with spaces is fine here".into(),
            value: "v".into(),
        };
        let bytes = bincode::serialize(&op).unwrap();
        let decoded: Operation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, op);
    }
}
