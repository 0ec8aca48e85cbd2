//! The replicated configuration store (FSM).
//!
//! The store holds the authoritative cluster configuration and applies
//! [`Command`]s deterministically: the only inputs to a mutation are the
//! current state, the command itself, and the application timestamp that
//! the state machine captures once per log entry. Maps are `BTreeMap`s so
//! iteration order and the canonical JSON snapshot are identical on every
//! node that has applied the same log prefix.
//!
//! Apply errors are returned as values and never abort replication.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use fleetcast_core::process::{ProcessConfig, ProcessId};
use fleetcast_core::{Error, Result};
use fleetcast_iam::access::Policy;
use fleetcast_iam::user::User;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::Command;

/// Operation tags, mirrored from the command envelope.
///
/// The [`Store::on_apply`] hook receives these so subscribers can decide
/// which caches to invalidate without inspecting command payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `addProcess`
    AddProcess,
    /// `removeProcess`
    RemoveProcess,
    /// `updateProcess`
    UpdateProcess,
    /// `setProcessMetadata`
    SetProcessMetadata,
    /// `addIdentity`
    AddIdentity,
    /// `updateIdentity`
    UpdateIdentity,
    /// `removeIdentity`
    RemoveIdentity,
    /// `setPolicies`
    SetPolicies,
    /// `addNode`
    AddNode,
    /// `removeNode`
    RemoveNode,
    /// `setNodeState`
    SetNodeState,
    /// `setKV`
    SetKv,
    /// `delKV`
    DeleteKv,
    /// `acquireLock`
    AcquireLock,
    /// `releaseLock`
    ReleaseLock,
}

impl Operation {
    /// Returns the wire tag of this operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AddProcess => "addProcess",
            Self::RemoveProcess => "removeProcess",
            Self::UpdateProcess => "updateProcess",
            Self::SetProcessMetadata => "setProcessMetadata",
            Self::AddIdentity => "addIdentity",
            Self::UpdateIdentity => "updateIdentity",
            Self::RemoveIdentity => "removeIdentity",
            Self::SetPolicies => "setPolicies",
            Self::AddNode => "addNode",
            Self::RemoveNode => "removeNode",
            Self::SetNodeState => "setNodeState",
            Self::SetKv => "setKV",
            Self::DeleteKv => "delKV",
            Self::AcquireLock => "acquireLock",
            Self::ReleaseLock => "releaseLock",
        }
    }

    /// Returns `true` if this operation touches the identity table.
    #[must_use]
    pub const fn touches_identities(&self) -> bool {
        matches!(self, Self::AddIdentity | Self::UpdateIdentity | Self::RemoveIdentity)
    }

    /// Returns `true` if this operation touches the policy table.
    #[must_use]
    pub const fn touches_policies(&self) -> bool {
        matches!(self, Self::SetPolicies | Self::RemoveIdentity)
    }

    /// Returns `true` if this operation touches the node table.
    #[must_use]
    pub const fn touches_nodes(&self) -> bool {
        matches!(self, Self::AddNode | Self::RemoveNode | Self::SetNodeState)
    }
}

/// Lifecycle state of a cluster node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// The node takes part in normal operation.
    #[default]
    Online,
    /// The node stays in the cluster but should not receive new work.
    Maintenance,
    /// The node is about to leave the cluster.
    Leave,
}

impl NodeState {
    /// Parses one of the accepted state strings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for anything but `online`, `maintenance`
    /// or `leave`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(Self::Online),
            "maintenance" => Ok(Self::Maintenance),
            "leave" => Ok(Self::Leave),
            _ => Err(Error::invalid_argument(format!("unsupported node state '{s}'"))),
        }
    }
}

/// A process definition as stored in the FSM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// When the definition was first added.
    pub created_at: DateTime<Utc>,
    /// When the definition was last changed.
    pub updated_at: DateTime<Utc>,
    /// The definition itself.
    pub config: ProcessConfig,
    /// Arbitrary per-process metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// A cluster node record as stored in the FSM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Raft node id.
    pub id: u64,
    /// Raft listen address.
    pub raft_address: String,
    /// Cluster API address.
    pub api_address: String,
    /// Username for the node's cluster API.
    pub username: String,
    /// Password for the node's cluster API.
    pub password: String,
    /// Lifecycle state.
    #[serde(default)]
    pub state: NodeState,
}

/// A key/value entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    /// The value.
    pub value: String,
    /// When the entry was last written.
    pub updated_at: DateTime<Utc>,
}

/// A distributed lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Point in time the lock expires on its own.
    pub valid_until: DateTime<Utc>,
}

/// The identity table with its modification timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserList {
    /// When the table was last changed.
    pub updated_at: DateTime<Utc>,
    /// The identities.
    pub users: Vec<User>,
}

/// The policy table with its modification timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyList {
    /// When the table was last changed.
    pub updated_at: DateTime<Utc>,
    /// The policies.
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsersTable {
    updated_at: DateTime<Utc>,
    users: BTreeMap<String, User>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PoliciesTable {
    updated_at: DateTime<Utc>,
    policies: BTreeMap<String, Vec<Policy>>,
}

/// The complete replicated state. This is exactly what a snapshot contains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    processes: BTreeMap<String, ProcessRecord>,
    users: UsersTable,
    policies: PoliciesTable,
    nodes: BTreeMap<u64, NodeDescriptor>,
    kv: BTreeMap<String, KvEntry>,
    locks: BTreeMap<String, LockEntry>,
}

type ApplyCallback = Box<dyn Fn(Operation) + Send + Sync>;

/// The replicated configuration store.
///
/// One instance lives on every node, driven by the Raft log through
/// [`crate::StoreStateMachine`]. Reads are local and lock-free of network
/// I/O; they clone on the way out so callers never alias FSM state.
pub struct Store {
    state: RwLock<StoreState>,
    callback: RwLock<Option<ApplyCallback>>,
    restoring: AtomicBool,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            callback: RwLock::new(None),
            restoring: AtomicBool::new(false),
        }
    }

    /// Registers the single `OnApply` subscriber.
    ///
    /// The callback is invoked synchronously after every successful apply,
    /// outside the store's write lock. It must not call back into the
    /// store; push the tag into a channel instead and react elsewhere.
    pub fn on_apply(&self, callback: impl Fn(Operation) + Send + Sync + 'static) {
        *self.callback.write() = Some(Box::new(callback));
    }

    /// Returns `true` while a snapshot restore is in flight or has failed.
    #[must_use]
    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::Acquire)
    }

    /// Applies one command with the given application timestamp.
    ///
    /// The timestamp is captured once per log entry by the state machine;
    /// apply itself never reads the wall clock, so replaying the same log
    /// produces the same state on every node.
    ///
    /// # Errors
    ///
    /// Returns the rejection for commands that do not pass their
    /// contract; the caller turns it into an error-valued response.
    pub fn apply(&self, cmd: &Command, applied_at: DateTime<Utc>) -> Result<()> {
        let result = {
            let mut state = self.state.write();
            match cmd {
                Command::AddProcess { config } => Self::add_process(&mut state, config, applied_at),
                Command::RemoveProcess { id } => Self::remove_process(&mut state, id),
                Command::UpdateProcess { id, config } => {
                    Self::update_process(&mut state, id, config, applied_at)
                }
                Command::SetProcessMetadata { id, key, value } => {
                    Self::set_process_metadata(&mut state, id, key, value.clone(), applied_at)
                }
                Command::AddIdentity { identity } => {
                    Self::add_identity(&mut state, identity, applied_at)
                }
                Command::UpdateIdentity { name, identity } => {
                    Self::update_identity(&mut state, name, identity, applied_at)
                }
                Command::RemoveIdentity { name } => {
                    Self::remove_identity(&mut state, name, applied_at)
                }
                Command::SetPolicies { name, policies } => {
                    Self::set_policies(&mut state, name, policies, applied_at)
                }
                Command::AddNode { id, raft_address, api_address, username, password } => {
                    state.nodes.insert(
                        *id,
                        NodeDescriptor {
                            id: *id,
                            raft_address: raft_address.clone(),
                            api_address: api_address.clone(),
                            username: username.clone(),
                            password: password.clone(),
                            state: NodeState::Online,
                        },
                    );
                    Ok(())
                }
                Command::RemoveNode { id } => {
                    if state.nodes.remove(id).is_none() {
                        return Err(Error::not_found(format!("node {id}")));
                    }
                    Ok(())
                }
                Command::SetNodeState { id, state: new_state } => {
                    let new_state = NodeState::parse(new_state)?;
                    match state.nodes.get_mut(id) {
                        Some(node) => {
                            node.state = new_state;
                            Ok(())
                        }
                        None => Err(Error::not_found(format!("node {id}"))),
                    }
                }
                Command::SetKv { key, value } => {
                    state.kv.insert(
                        key.clone(),
                        KvEntry { value: value.clone(), updated_at: applied_at },
                    );
                    Ok(())
                }
                Command::DeleteKv { key } => {
                    if state.kv.remove(key).is_none() {
                        return Err(Error::not_found(format!("key '{key}'")));
                    }
                    Ok(())
                }
                Command::AcquireLock { name, valid_until } => {
                    if let Some(lock) = state.locks.get(name) {
                        if lock.valid_until > applied_at {
                            return Err(Error::already_exists(format!("lock '{name}' is held")));
                        }
                    }
                    state.locks.insert(name.clone(), LockEntry { valid_until: *valid_until });
                    Ok(())
                }
                Command::ReleaseLock { name } => {
                    if state.locks.remove(name).is_none() {
                        return Err(Error::not_found(format!("lock '{name}'")));
                    }
                    Ok(())
                }
            }
        };

        // The write lock is released; fire the hook only for applied
        // commands. The hook must not re-enter the store.
        if result.is_ok() {
            let callback = self.callback.read();
            if let Some(cb) = callback.as_ref() {
                cb(cmd.operation());
            }
        }

        result
    }

    fn add_process(
        state: &mut StoreState,
        config: &ProcessConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = config.process_id().to_string();

        if state.processes.contains_key(&id) {
            return Err(Error::already_exists(format!("process '{id}' already exists")));
        }

        state.processes.insert(
            id,
            ProcessRecord {
                created_at: now,
                updated_at: now,
                config: config.clone(),
                metadata: BTreeMap::new(),
            },
        );

        Ok(())
    }

    fn remove_process(state: &mut StoreState, id: &ProcessId) -> Result<()> {
        let id = id.to_string();
        if state.processes.remove(&id).is_none() {
            return Err(Error::not_found(format!("process '{id}'")));
        }
        Ok(())
    }

    fn update_process(
        state: &mut StoreState,
        id: &ProcessId,
        config: &ProcessConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let src = id.to_string();
        let dst = config.process_id().to_string();

        let Some(current) = state.processes.get(&src) else {
            return Err(Error::not_found(format!("process '{src}'")));
        };

        if current.config.hash() == config.hash() {
            return Ok(());
        }

        let mut record = current.clone();
        record.config = config.clone();
        record.updated_at = now;

        if src != dst {
            if state.processes.contains_key(&dst) {
                return Err(Error::already_exists(format!("process '{dst}' already exists")));
            }
            state.processes.remove(&src);
        }

        state.processes.insert(dst, record);

        Ok(())
    }

    fn set_process_metadata(
        state: &mut StoreState,
        id: &ProcessId,
        key: &str,
        value: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        let Some(record) = state.processes.get_mut(&id) else {
            return Err(Error::not_found(format!("process '{id}'")));
        };

        match value {
            Some(value) => {
                record.metadata.insert(key.to_string(), value);
            }
            None => {
                record.metadata.remove(key);
            }
        }
        record.updated_at = now;

        Ok(())
    }

    fn add_identity(state: &mut StoreState, identity: &User, now: DateTime<Utc>) -> Result<()> {
        identity.validate()?;

        if state.users.users.contains_key(&identity.name) {
            return Err(Error::already_exists(format!(
                "identity '{}' already exists",
                identity.name
            )));
        }

        state.users.updated_at = now;
        state.users.users.insert(identity.name.clone(), identity.clone());

        Ok(())
    }

    fn update_identity(
        state: &mut StoreState,
        name: &str,
        identity: &User,
        now: DateTime<Utc>,
    ) -> Result<()> {
        identity.validate()?;

        if !state.users.users.contains_key(name) {
            return Err(Error::not_found(format!("identity '{name}'")));
        }

        if name != identity.name && state.users.users.contains_key(&identity.name) {
            return Err(Error::already_exists(format!(
                "identity '{}' already exists",
                identity.name
            )));
        }

        state.users.users.remove(name);
        state.users.users.insert(identity.name.clone(), identity.clone());
        state.users.updated_at = now;

        // Policies follow the identity across a rename.
        if name != identity.name {
            if let Some(policies) = state.policies.policies.remove(name) {
                state.policies.policies.insert(identity.name.clone(), policies);
                state.policies.updated_at = now;
            }
        }

        Ok(())
    }

    fn remove_identity(state: &mut StoreState, name: &str, now: DateTime<Utc>) -> Result<()> {
        state.users.users.remove(name);
        state.users.updated_at = now;
        state.policies.policies.remove(name);
        state.policies.updated_at = now;

        Ok(())
    }

    fn set_policies(
        state: &mut StoreState,
        name: &str,
        policies: &[Policy],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("policy subject must not be empty"));
        }

        state.policies.policies.insert(name.to_string(), policies.to_vec());
        state.policies.updated_at = now;

        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Returns all process records.
    #[must_use]
    pub fn process_list(&self) -> Vec<ProcessRecord> {
        self.state.read().processes.values().cloned().collect()
    }

    /// Returns one process record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the process is absent.
    pub fn get_process(&self, id: &ProcessId) -> Result<ProcessRecord> {
        self.state
            .read()
            .processes
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| Error::not_found(format!("process '{id}'")))
    }

    /// Returns all identities with the table's modification time.
    #[must_use]
    pub fn user_list(&self) -> UserList {
        let state = self.state.read();
        UserList {
            updated_at: state.users.updated_at,
            users: state.users.users.values().cloned().collect(),
        }
    }

    /// Returns a single identity, if present, with the table's
    /// modification time.
    #[must_use]
    pub fn get_user(&self, name: &str) -> UserList {
        let state = self.state.read();
        UserList {
            updated_at: state.users.updated_at,
            users: state.users.users.get(name).cloned().into_iter().collect(),
        }
    }

    /// Returns all policies with the table's modification time.
    #[must_use]
    pub fn policy_list(&self) -> PolicyList {
        let state = self.state.read();
        PolicyList {
            updated_at: state.policies.updated_at,
            policies: state.policies.policies.values().flatten().cloned().collect(),
        }
    }

    /// Returns the policies of one subject with the table's modification
    /// time.
    #[must_use]
    pub fn policy_user_list(&self, name: &str) -> PolicyList {
        let state = self.state.read();
        PolicyList {
            updated_at: state.policies.updated_at,
            policies: state.policies.policies.get(name).cloned().unwrap_or_default(),
        }
    }

    /// Returns all node records.
    #[must_use]
    pub fn node_list(&self) -> Vec<NodeDescriptor> {
        self.state.read().nodes.values().cloned().collect()
    }

    /// Returns one node record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the node is absent.
    pub fn get_node(&self, id: u64) -> Result<NodeDescriptor> {
        self.state
            .read()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {id}")))
    }

    /// Returns one key/value entry.
    #[must_use]
    pub fn kv_get(&self, key: &str) -> Option<KvEntry> {
        self.state.read().kv.get(key).cloned()
    }

    /// Returns one lock entry.
    #[must_use]
    pub fn lock_get(&self, name: &str) -> Option<LockEntry> {
        self.state.read().locks.get(name).cloned()
    }

    // ========================================================================
    // Snapshot & restore
    // ========================================================================

    /// Serializes the complete state as canonical JSON under the read lock.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on a serialization fault.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        serde_json::to_vec(&*state).map_err(Into::into)
    }

    /// Replaces the complete state from a snapshot blob.
    ///
    /// Missing optional fields are normalized while decoding (absent
    /// metadata maps become empty maps), so a snapshot round-trip is
    /// idempotent. While the restore is in flight the store reports
    /// [`Store::is_restoring`], which feeds the cluster's degraded flag.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on a corrupt blob; the store keeps its previous
    /// state and stays marked as restoring.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        self.restoring.store(true, Ordering::Release);

        let new_state: StoreState = serde_json::from_slice(data)?;

        *self.state.write() = new_state;
        self.restoring.store(false, Ordering::Release);

        Ok(())
    }
}

impl fleetcast_iam::manager::IdentityAdapter for Store {
    fn identities(&self) -> Vec<User> {
        self.user_list().users
    }
}

impl fleetcast_iam::manager::PolicyAdapter for Store {
    fn policies(&self) -> Vec<Policy> {
        self.policy_list().policies
    }
}
