//! OpenRaft type configuration for fleetcast.

use std::io::Cursor;

use openraft::BasicNode;
use serde::{Deserialize, Serialize};

use crate::command::StampedCommand;
use crate::response::CommandResponse;

/// Node identifier type for the Raft cluster.
///
/// Node ids must be unique across the cluster and stable across restarts.
pub type RaftNodeId = u64;

/// OpenRaft type configuration for the fleetcast configuration store.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    /// The command type replicated through the Raft log, stamped with
    /// its application timestamp by the proposing leader.
    type D = StampedCommand;

    /// The response type returned after applying a command.
    ///
    /// Apply errors are carried inside the response; they never abort
    /// replication.
    type R = CommandResponse;

    /// Node identifier type.
    type NodeId = RaftNodeId;

    /// Node information: the raft address.
    type Node = BasicNode;

    /// Log entry type.
    type Entry = openraft::Entry<TypeConfig>;

    /// Snapshot data: the store's canonical JSON dump, wrapped in a cursor
    /// for streaming.
    type SnapshotData = Cursor<Vec<u8>>;

    /// Async runtime.
    type AsyncRuntime = openraft::TokioRuntime;

    /// Responder for client write requests.
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

/// Type alias for the Raft instance with fleetcast configuration.
pub type FleetRaft = openraft::Raft<TypeConfig>;

/// Type alias for Raft log entries.
pub type RaftEntry = openraft::Entry<TypeConfig>;

/// Type alias for Raft log ids.
pub type RaftLogId = openraft::LogId<RaftNodeId>;

/// Type alias for Raft votes.
pub type RaftVote = openraft::Vote<RaftNodeId>;

/// Type alias for stored membership configuration.
pub type RaftMembership = openraft::StoredMembership<RaftNodeId, BasicNode>;

/// Type alias for snapshot metadata.
pub type RaftSnapshotMeta = openraft::SnapshotMeta<RaftNodeId, BasicNode>;
