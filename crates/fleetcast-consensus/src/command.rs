//! Commands that go through Raft consensus.
//!
//! Every mutation of the replicated configuration is encoded as a
//! [`Command`] and appended to the Raft log. A command is applied to the
//! state machine only after a quorum of nodes has persisted it, and every
//! node applies the same commands in the same order.
//!
//! The wire envelope is `{ "operation": <tag>, "data": { ... } }`; the
//! operation tags are part of the cluster's wire contract and never change
//! meaning.

use chrono::{DateTime, Utc};
use fleetcast_core::process::{ProcessConfig, ProcessId};
use fleetcast_iam::access::Policy;
use fleetcast_iam::user::User;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A replicated mutation of the configuration store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", content = "data")]
pub enum Command {
    // ========================================================================
    // Process definitions
    // ========================================================================
    /// Add a process definition.
    ///
    /// The `(id, domain)` pair is unique cluster-wide.
    #[serde(rename = "addProcess")]
    AddProcess {
        /// The process definition.
        config: ProcessConfig,
    },

    /// Remove a process definition.
    #[serde(rename = "removeProcess")]
    RemoveProcess {
        /// Identity of the process to remove.
        id: ProcessId,
    },

    /// Replace a process definition, possibly under a new `(id, domain)`.
    #[serde(rename = "updateProcess")]
    UpdateProcess {
        /// Identity of the definition being replaced.
        id: ProcessId,
        /// The replacement definition.
        config: ProcessConfig,
    },

    /// Set or delete one metadata key of a process.
    #[serde(rename = "setProcessMetadata")]
    SetProcessMetadata {
        /// Identity of the process.
        id: ProcessId,
        /// Metadata key.
        key: String,
        /// New value; `None` deletes the key.
        value: Option<Value>,
    },

    // ========================================================================
    // Identities & policies
    // ========================================================================
    /// Add an identity.
    #[serde(rename = "addIdentity")]
    AddIdentity {
        /// The identity to add.
        identity: User,
    },

    /// Replace an identity, possibly under a new name.
    #[serde(rename = "updateIdentity")]
    UpdateIdentity {
        /// Current name of the identity.
        name: String,
        /// The replacement identity.
        identity: User,
    },

    /// Remove an identity together with its policies.
    #[serde(rename = "removeIdentity")]
    RemoveIdentity {
        /// Name of the identity to remove.
        name: String,
    },

    /// Replace all policies of one identity.
    #[serde(rename = "setPolicies")]
    SetPolicies {
        /// Policy subject; `$anon` is allowed.
        name: String,
        /// The complete new policy set.
        policies: Vec<Policy>,
    },

    // ========================================================================
    // Node membership
    // ========================================================================
    /// Record a cluster node so peers can discover and dial it.
    #[serde(rename = "addNode")]
    AddNode {
        /// Raft node id.
        id: u64,
        /// Raft listen address.
        raft_address: String,
        /// Cluster API address.
        api_address: String,
        /// Username for the node's cluster API.
        username: String,
        /// Password for the node's cluster API.
        password: String,
    },

    /// Remove a cluster node record.
    #[serde(rename = "removeNode")]
    RemoveNode {
        /// Raft node id.
        id: u64,
    },

    /// Set the lifecycle state of a node.
    ///
    /// Only `online`, `maintenance` and `leave` are accepted.
    #[serde(rename = "setNodeState")]
    SetNodeState {
        /// Raft node id.
        id: u64,
        /// The new state string.
        state: String,
    },

    // ========================================================================
    // Key/value entries & locks
    // ========================================================================
    /// Set a key/value entry.
    #[serde(rename = "setKV")]
    SetKv {
        /// Key.
        key: String,
        /// Value.
        value: String,
    },

    /// Delete a key/value entry.
    #[serde(rename = "delKV")]
    DeleteKv {
        /// Key.
        key: String,
    },

    /// Acquire a named lock until the given deadline.
    #[serde(rename = "acquireLock")]
    AcquireLock {
        /// Lock name.
        name: String,
        /// Point in time the lock expires on its own.
        valid_until: DateTime<Utc>,
    },

    /// Release a named lock.
    #[serde(rename = "releaseLock")]
    ReleaseLock {
        /// Lock name.
        name: String,
    },
}

/// A command with its application timestamp, as carried in the raft log.
///
/// The proposing leader stamps the command once; every replica applies it
/// with the same timestamp, so replayed logs produce byte-identical
/// states. The state machine never reads the wall clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedCommand {
    /// When the leader accepted the command.
    pub at: DateTime<Utc>,
    /// The command itself.
    pub command: Command,
}

impl Command {
    /// Returns the operation tag of this command.
    #[must_use]
    pub fn operation(&self) -> crate::store::Operation {
        use crate::store::Operation;
        match self {
            Self::AddProcess { .. } => Operation::AddProcess,
            Self::RemoveProcess { .. } => Operation::RemoveProcess,
            Self::UpdateProcess { .. } => Operation::UpdateProcess,
            Self::SetProcessMetadata { .. } => Operation::SetProcessMetadata,
            Self::AddIdentity { .. } => Operation::AddIdentity,
            Self::UpdateIdentity { .. } => Operation::UpdateIdentity,
            Self::RemoveIdentity { .. } => Operation::RemoveIdentity,
            Self::SetPolicies { .. } => Operation::SetPolicies,
            Self::AddNode { .. } => Operation::AddNode,
            Self::RemoveNode { .. } => Operation::RemoveNode,
            Self::SetNodeState { .. } => Operation::SetNodeState,
            Self::SetKv { .. } => Operation::SetKv,
            Self::DeleteKv { .. } => Operation::DeleteKv,
            Self::AcquireLock { .. } => Operation::AcquireLock,
            Self::ReleaseLock { .. } => Operation::ReleaseLock,
        }
    }

    /// Returns the process id this command operates on, if any.
    #[must_use]
    pub fn process_id(&self) -> Option<ProcessId> {
        match self {
            Self::AddProcess { config } | Self::UpdateProcess { config, .. } => {
                Some(config.process_id())
            }
            Self::RemoveProcess { id } | Self::SetProcessMetadata { id, .. } => Some(id.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_tags_on_the_wire() {
        let cmd = Command::RemoveProcess { id: ProcessId::new("p1", "d") };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["operation"], "removeProcess");
        assert_eq!(json["data"]["id"]["id"], "p1");

        let cmd = Command::SetKv { key: "k".to_string(), value: "v".to_string() };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["operation"], "setKV");

        let cmd = Command::DeleteKv { key: "k".to_string() };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["operation"], "delKV");
    }

    #[test]
    fn test_envelope_round_trip() {
        let cmd = Command::AddProcess {
            config: ProcessConfig { id: "p1".to_string(), domain: "d".to_string(), ..Default::default() },
        };

        let bytes = serde_json::to_vec(&cmd).unwrap();
        let back: Command = serde_json::from_slice(&bytes).unwrap();

        assert!(matches!(back, Command::AddProcess { config } if config.id == "p1"));
    }

    #[test]
    fn test_metadata_value_survives_the_log_codec() {
        // Metadata values are arbitrary JSON, which is why log entries
        // are JSON-encoded.
        let cmd = Command::SetProcessMetadata {
            id: ProcessId::new("p1", "d"),
            key: "k".to_string(),
            value: Some(serde_json::json!({"nested": [1, 2, {"deep": true}]})),
        };

        let bytes = serde_json::to_vec(&cmd).unwrap();
        let back: Command = serde_json::from_slice(&bytes).unwrap();

        let Command::SetProcessMetadata { value: Some(value), .. } = back else {
            panic!("wrong variant");
        };
        assert_eq!(value["nested"][2]["deep"], true);
    }

    #[test]
    fn test_process_id_accessor() {
        let cmd = Command::SetProcessMetadata {
            id: ProcessId::new("p1", "d"),
            key: "k".to_string(),
            value: None,
        };
        assert_eq!(cmd.process_id().unwrap().to_string(), "p1@d");

        let cmd = Command::ReleaseLock { name: "l".to_string() };
        assert!(cmd.process_id().is_none());
    }
}
