//! Raft-based replicated configuration store for the fleetcast cluster.
//!
//! This crate implements a single Raft group holding the authoritative
//! cluster configuration: process definitions, identities, access policies,
//! node membership, key/value entries and distributed locks.
//!
//! # Architecture
//!
//! ```text
//!        follower                       leader
//!  ┌──────────────────┐        ┌──────────────────────┐
//!  │  mutation        │        │  cluster API          │
//!  │     │            │  HTTP  │     │                 │
//!  │  Forwarder ──────┼───────▶│  Coordinator          │
//!  └──────────────────┘        │     │ client_write    │
//!                              │   Raft ── replicate ──┼──▶ every node
//!                              └──────────────────────┘
//!                                          │
//!                                     Store (FSM)
//!                                          │
//!                                      OnApply ──▶ IAM / node registry
//! ```
//!
//! Reads consult the local state machine; all mutations travel through the
//! leader and the Raft log, so every node applies the same commands in the
//! same order.

#![warn(missing_docs)]

pub mod api;
pub mod command;
pub mod log_storage;
pub mod network;
pub mod response;
pub mod store;
pub mod types;

mod cluster;
mod forwarder;
mod state_machine;

pub use cluster::{Cluster, ClusterOptions};
pub use command::{Command, StampedCommand};
pub use forwarder::Forwarder;
pub use log_storage::RedbLogStorage;
pub use response::CommandResponse;
pub use state_machine::StoreStateMachine;
pub use store::{
    KvEntry, LockEntry, NodeDescriptor, NodeState, Operation, PolicyList, ProcessRecord, Store,
    UserList,
};
pub use types::{FleetRaft, RaftNodeId, TypeConfig};
