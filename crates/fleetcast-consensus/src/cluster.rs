//! Cluster coordination.
//!
//! The [`Cluster`] owns the raft instance and everything around it: the
//! durable log, the HTTP raft transport, the forwarder, leader tracking
//! and the emergency-leader sentinel. It is the single entry point for
//! mutations: leaders apply commands through raft, followers forward them.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetcast_core::process::{ProcessConfig, ProcessId};
use fleetcast_core::{Error, ErrorKind, Result};
use fleetcast_iam::access::Policy;
use fleetcast_iam::user::User;
use openraft::error::RaftError;
use openraft::{BasicNode, ChangeMembers, Config, Raft};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::forwarder::Forwarder;
use crate::log_storage::RedbLogStorage;
use crate::network::{serve_raft, ContactTracker, HttpNetworkFactory};
use crate::state_machine::StoreStateMachine;
use crate::store::{NodeState, Store};
use crate::types::{FleetRaft, RaftNodeId};

/// Grace period while waiting to disappear from the raft configuration.
const RAFT_REMOVE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Apply timeout for commands submitted to raft.
const APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Contact loss threshold of the emergency-leader sentinel.
const EMERGENCY_THRESHOLD: Duration = Duration::from_secs(10);

/// Options for constructing a [`Cluster`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Unique, stable id of this node.
    pub node_id: u64,
    /// Human-readable node name.
    pub name: String,
    /// Directory where raft state is kept.
    pub path: std::path::PathBuf,
    /// Raft listen address. The cluster API listens at port + 1.
    pub raft_address: SocketAddr,
    /// Bootstrap a new cluster if no prior raft state exists.
    pub bootstrap: bool,
    /// Address of a cluster member to join instead of bootstrapping.
    pub join_address: Option<String>,
    /// Username for the cluster API.
    pub username: String,
    /// Password for the cluster API.
    pub password: String,
}

#[derive(Debug, Default)]
struct LeaderFlags {
    is_raft_leader: bool,
    has_raft_leader: bool,
    emergency: bool,
}

type ProcessCommandHook = Box<dyn Fn(ProcessId, String) + Send + Sync>;

/// The cluster coordinator.
pub struct Cluster {
    id: u64,
    raft_address: SocketAddr,
    raft: FleetRaft,
    store: Arc<Store>,
    forwarder: Arc<Forwarder>,
    contact: Arc<ContactTracker>,

    leader: Mutex<LeaderFlags>,

    process_command_hook: RwLock<Option<ProcessCommandHook>>,

    shutdown_tx: watch::Sender<bool>,
    raft_server_shutdown: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    is_shutdown: AtomicBool,
}

impl Cluster {
    /// Creates the coordinator: opens the log store, starts raft and its
    /// transport, and begins joining if a join address is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the log store cannot be opened or raft cannot
    /// start. Both are fatal at boot.
    pub async fn new(options: ClusterOptions) -> Result<Arc<Self>> {
        let store = Arc::new(Store::new());

        let log_storage = RedbLogStorage::open(&options.path)
            .map_err(|e| Error::internal(format!("raft log store: {e}")))?;
        let state_machine = StoreStateMachine::new(store.clone());

        let raft_config = Config {
            cluster_name: "fleetcast".to_string(),
            heartbeat_interval: 250,
            election_timeout_min: 1000,
            election_timeout_max: 2000,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(5000),
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| Error::internal(format!("invalid raft config: {e}")))?,
        );

        let network = HttpNetworkFactory::new();

        let raft = Raft::new(options.node_id, raft_config, network, log_storage, state_machine)
            .await
            .map_err(|e| Error::internal(format!("starting raft: {e}")))?;

        info!(node_id = options.node_id, raft_addr = %options.raft_address, "raft started");

        let contact = Arc::new(ContactTracker::new());
        let raft_server_shutdown = serve_raft(options.raft_address, raft.clone(), contact.clone())
            .await
            .map_err(|e| Error::internal(format!("raft transport: {e}")))?;

        if options.bootstrap {
            let initialized = raft
                .is_initialized()
                .await
                .map_err(|e| Error::internal(format!("raft state: {e}")))?;
            if !initialized {
                let mut members = std::collections::BTreeMap::new();
                members.insert(
                    options.node_id,
                    BasicNode { addr: options.raft_address.to_string() },
                );
                raft.initialize(members)
                    .await
                    .map_err(|e| Error::internal(format!("bootstrap: {e}")))?;
                info!(node_id = options.node_id, "cluster bootstrapped");
            }
        }

        let forwarder = Arc::new(Forwarder::new(
            options.node_id,
            options.username.clone(),
            options.password.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        let cluster = Arc::new(Self {
            id: options.node_id,
            raft_address: options.raft_address,
            raft,
            store,
            forwarder,
            contact,
            leader: Mutex::new(LeaderFlags::default()),
            process_command_hook: RwLock::new(None),
            shutdown_tx,
            raft_server_shutdown: Mutex::new(Some(raft_server_shutdown)),
            is_shutdown: AtomicBool::new(false),
        });

        cluster.clone().spawn_leader_tracking();
        cluster.clone().spawn_sentinel();

        if let Some(join_address) = options.join_address.clone() {
            cluster.clone().spawn_join_loop(join_address, options);
        }

        Ok(cluster)
    }

    /// Returns this node's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns this node's raft address.
    #[must_use]
    pub fn raft_address(&self) -> SocketAddr {
        self.raft_address
    }

    /// Returns the replicated store.
    #[must_use]
    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Returns the forwarder.
    #[must_use]
    pub fn forwarder(&self) -> Arc<Forwarder> {
        self.forwarder.clone()
    }

    /// Returns a receiver that flips to `true` on shutdown.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Derives the cluster API address from a raft address: same host,
    /// port + 1.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the address does not parse.
    pub fn api_addr(raft_address: &str) -> Result<String> {
        let (host, port) = raft_address
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_argument(format!("invalid address '{raft_address}'")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::invalid_argument(format!("invalid port in '{raft_address}'")))?;
        Ok(format!("{host}:{}", port + 1))
    }

    /// Registers the hook invoked when the leader relays a process
    /// command to its supervisor.
    pub fn on_process_command(&self, hook: impl Fn(ProcessId, String) + Send + Sync + 'static) {
        *self.process_command_hook.write() = Some(Box::new(hook));
    }

    /// Returns `true` if this node currently is the raft leader.
    #[must_use]
    pub fn is_raft_leader(&self) -> bool {
        self.leader.lock().is_raft_leader
    }

    /// Returns `true` if some node currently is the raft leader.
    #[must_use]
    pub fn has_raft_leader(&self) -> bool {
        self.leader.lock().has_raft_leader
    }

    /// Returns `true` while the sentinel forces local leadership.
    #[must_use]
    pub fn is_emergency_leader(&self) -> bool {
        self.leader.lock().emergency
    }

    /// Returns `true` if the cluster cannot accept writes: no leader, or
    /// the local state machine is restoring.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        if self.store.is_restoring() {
            return true;
        }
        !self.has_raft_leader()
    }

    /// Returns raft runtime statistics as a flat string map.
    ///
    /// `last_contact` is a duration like `"1.503s"`, or the literal
    /// `"never"` if this node never heard from a leader. On the leader it
    /// is always `"0.000s"`.
    #[must_use]
    pub fn stats(&self) -> std::collections::BTreeMap<String, String> {
        let metrics = self.raft.metrics().borrow().clone();
        let mut stats = std::collections::BTreeMap::new();

        stats.insert("state".to_string(), format!("{:?}", metrics.state));
        stats.insert("term".to_string(), metrics.current_term.to_string());
        stats.insert(
            "last_log_index".to_string(),
            metrics.last_log_index.map_or_else(|| "0".to_string(), |i| i.to_string()),
        );
        stats.insert(
            "applied_index".to_string(),
            metrics.last_applied.map_or_else(|| "0".to_string(), |l| l.index.to_string()),
        );
        stats.insert(
            "leader_id".to_string(),
            metrics.current_leader.map_or_else(|| "none".to_string(), |l| l.to_string()),
        );

        let last_contact = if self.is_raft_leader() {
            "0.000s".to_string()
        } else {
            self.contact.as_stat()
        };
        stats.insert("last_contact".to_string(), last_contact);

        stats
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Handles a join request.
    ///
    /// Followers forward to the leader. The leader reconciles the raft
    /// configuration (removing a colliding entry first), adds the node as
    /// a voter and records it in the FSM so peers can connect back.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership change fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn join(
        &self,
        origin: Option<u64>,
        id: u64,
        raft_address: &str,
        api_address: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        if !self.is_raft_leader() {
            debug!("not leader, forwarding join");
            return self
                .forwarder
                .join(origin, None, id, raft_address, api_address, username, password)
                .await;
        }

        debug!(node_id = id, address = raft_address, "join request for remote node");

        let membership = self.raft.metrics().borrow().membership_config.clone();

        for (node_id, node) in membership.nodes() {
            if *node_id != id && node.addr != raft_address {
                continue;
            }

            if *node_id == id && node.addr == raft_address {
                debug!(node_id = id, "node is already a member, ignoring join");
                return Ok(());
            }

            // A node with either the same id or the same address exists;
            // it has to go before the new one can be added.
            let stale: BTreeSet<RaftNodeId> = [*node_id].into();
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(stale.clone()), false)
                .await
                .map_err(map_write_error)?;
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(stale), false)
                .await
                .map_err(map_write_error)?;
        }

        self.raft
            .add_learner(id, BasicNode { addr: raft_address.to_string() }, true)
            .await
            .map_err(map_write_error)?;

        let voters: BTreeSet<RaftNodeId> = [id].into();
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(voters), false)
            .await
            .map_err(map_write_error)?;

        // Record the node in the FSM. A failure here leaves the node a
        // raft member without a descriptor; peers pick it up on the next
        // join attempt.
        if let Err(e) = self
            .apply_command(Command::AddNode {
                id,
                raft_address: raft_address.to_string(),
                api_address: api_address.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            })
            .await
        {
            debug!(error = %e, "recording joined node failed");
        }

        info!(node_id = id, address = raft_address, "node joined");

        Ok(())
    }

    /// Gracefully removes a node from the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if forwarding or the membership change fails.
    pub async fn leave(&self, origin: Option<u64>, id: Option<u64>) -> Result<()> {
        let id = id.unwrap_or(self.id);

        debug!(node_id = id, "leave request");

        // A forced-local leader does not really hold the cluster lease;
        // drop the flag and leave through the follower path.
        if id == self.id && self.is_emergency_leader() {
            self.leader.lock().emergency = false;
        }

        if !self.is_raft_leader() {
            self.forwarder.leave(origin, id).await?;
            if id == self.id && !self.wait_until_removed().await {
                warn!("failed to leave raft configuration gracefully, timeout");
            }
            return Ok(());
        }

        let membership = self.raft.metrics().borrow().membership_config.clone();
        let num_voters = membership.voter_ids().count();

        if id == self.id {
            if num_voters <= 1 {
                debug!("leader without peers, leave is a no-op");
                return Ok(());
            }

            self.leadership_transfer().await?;

            // Wait for the new leader to be observed.
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let flags = self.leader.lock();
                if flags.has_raft_leader && !flags.is_raft_leader {
                    break;
                }
            }

            self.forwarder.leave(None, id).await?;
            self.wait_until_removed().await;
            return Ok(());
        }

        // Leader removing another node.
        if let Err(e) = self.apply_command(Command::RemoveNode { id }).await {
            error!(error = %e, node_id = id, "removing node record failed");
        }

        let members: BTreeSet<RaftNodeId> = [id].into();
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(members.clone()), false)
            .await
            .map_err(map_write_error)?;
        self.raft
            .change_membership(ChangeMembers::RemoveNodes(members), false)
            .await
            .map_err(map_write_error)?;

        Ok(())
    }

    /// Polls the local configuration until this node is gone, bounded by
    /// the remove grace period. Returns `true` if the node disappeared.
    async fn wait_until_removed(&self) -> bool {
        let deadline = tokio::time::Instant::now() + RAFT_REMOVE_GRACE_PERIOD;

        while tokio::time::Instant::now() < deadline {
            debug!("waiting to disappear from the configuration");
            tokio::time::sleep(Duration::from_millis(50)).await;

            let membership = self.raft.metrics().borrow().membership_config.clone();
            let present = membership.nodes().any(|(id, _)| *id == self.id);
            if !present {
                return true;
            }
        }

        false
    }

    /// Hands leadership to another voter by asking it to start an
    /// election.
    async fn leadership_transfer(&self) -> Result<()> {
        let membership = self.raft.metrics().borrow().membership_config.clone();

        let target = membership
            .voter_ids()
            .find(|id| *id != self.id)
            .ok_or_else(|| Error::internal("no other voter to transfer leadership to"))?;

        let target_node = membership
            .nodes()
            .find(|(id, _)| **id == target)
            .map(|(_, node)| node.clone())
            .ok_or_else(|| Error::internal("transfer target has no address"))?;

        let api_address = Self::api_addr(&target_node.addr)?;

        info!(target, address = %api_address, "transferring leadership");

        self.forwarder.transfer_leadership(&api_address).await
    }

    /// Triggers a local election. Served by the cluster API for
    /// leadership transfer; also used by the sentinel.
    pub async fn trigger_election(&self) -> Result<()> {
        self.raft
            .trigger()
            .elect()
            .await
            .map_err(|e| Error::internal(format!("triggering election: {e}")))
    }

    // ========================================================================
    // Command submission
    // ========================================================================

    /// Serializes and submits a command to raft with the apply timeout.
    ///
    /// # Errors
    ///
    /// `NotLeader` (with a leader hint) if this node cannot accept writes,
    /// `Timeout` if the apply budget elapsed, or the rejection computed by
    /// the state machine.
    pub async fn apply_command(&self, cmd: Command) -> Result<()> {
        let stamped = crate::command::StampedCommand { at: chrono::Utc::now(), command: cmd };
        let write = self.raft.client_write(stamped);

        let result = match tokio::time::timeout(APPLY_TIMEOUT, write).await {
            Err(_) => Err(Error::timeout("applying command timed out")),
            Ok(Ok(response)) => response.data.into_result(),
            Ok(Err(e)) => Err(map_write_error(e)),
        };

        metrics::counter!(
            "fleetcast_commands_applied",
            "ok" => if result.is_ok() { "true" } else { "false" }
        )
        .increment(1);

        result
    }

    /// Returns the current FSM snapshot blob. Followers forward to the
    /// leader.
    ///
    /// # Errors
    ///
    /// Returns `Degraded` if the cluster has no leader.
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        if !self.is_raft_leader() {
            debug!("not leader, forwarding snapshot request");
            return self.forwarder.snapshot().await;
        }

        self.store.snapshot_bytes()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    fn check_writable(&self) -> Result<()> {
        if self.is_degraded() {
            return Err(Error::degraded());
        }
        Ok(())
    }

    /// Adds a process definition.
    pub async fn add_process(&self, origin: Option<u64>, config: ProcessConfig) -> Result<()> {
        self.check_writable()?;

        if config.id.is_empty() {
            return Err(Error::invalid_argument("process id must not be empty"));
        }

        if !self.is_raft_leader() {
            return self.forwarder.add_process(origin, &config).await;
        }

        self.apply_command(Command::AddProcess { config }).await
    }

    /// Replaces a process definition.
    pub async fn update_process(
        &self,
        origin: Option<u64>,
        id: ProcessId,
        config: ProcessConfig,
    ) -> Result<()> {
        self.check_writable()?;

        if !self.is_raft_leader() {
            return self.forwarder.update_process(origin, &id, &config).await;
        }

        self.apply_command(Command::UpdateProcess { id, config }).await
    }

    /// Removes a process definition.
    pub async fn remove_process(&self, origin: Option<u64>, id: ProcessId) -> Result<()> {
        self.check_writable()?;

        if !self.is_raft_leader() {
            return self.forwarder.remove_process(origin, &id).await;
        }

        self.apply_command(Command::RemoveProcess { id }).await
    }

    /// Relays a process command (`start`, `stop`, `suspend`, `resume`) to
    /// the supervisor through the leader.
    pub async fn set_process_command(
        &self,
        origin: Option<u64>,
        id: ProcessId,
        command: &str,
    ) -> Result<()> {
        self.check_writable()?;

        match command {
            "start" | "stop" | "suspend" | "resume" => {}
            _ => return Err(Error::invalid_argument(format!("unknown command '{command}'"))),
        }

        if !self.is_raft_leader() {
            return self.forwarder.set_process_command(origin, &id, command).await;
        }

        // The command is not replicated; the leader hands it to the local
        // supervisor relay which dispatches to the owning node.
        self.store.get_process(&id)?;

        let hook = self.process_command_hook.read();
        if let Some(hook) = hook.as_ref() {
            hook(id, command.to_string());
        }

        Ok(())
    }

    /// Sets or deletes one metadata key of a process.
    pub async fn set_process_metadata(
        &self,
        origin: Option<u64>,
        id: ProcessId,
        key: String,
        value: Option<Value>,
    ) -> Result<()> {
        self.check_writable()?;

        if !self.is_raft_leader() {
            return self.forwarder.set_process_metadata(origin, &id, &key, value).await;
        }

        self.apply_command(Command::SetProcessMetadata { id, key, value }).await
    }

    /// Adds an identity.
    pub async fn add_identity(&self, origin: Option<u64>, identity: User) -> Result<()> {
        self.check_writable()?;
        identity.validate()?;

        if !self.is_raft_leader() {
            return self.forwarder.add_identity(origin, &identity).await;
        }

        self.apply_command(Command::AddIdentity { identity }).await
    }

    /// Replaces an identity, possibly under a new name.
    pub async fn update_identity(
        &self,
        origin: Option<u64>,
        name: String,
        identity: User,
    ) -> Result<()> {
        self.check_writable()?;
        identity.validate()?;

        if !self.is_raft_leader() {
            return self.forwarder.update_identity(origin, &name, &identity).await;
        }

        self.apply_command(Command::UpdateIdentity { name, identity }).await
    }

    /// Removes an identity together with its policies.
    pub async fn remove_identity(&self, origin: Option<u64>, name: String) -> Result<()> {
        self.check_writable()?;

        if !self.is_raft_leader() {
            return self.forwarder.remove_identity(origin, &name).await;
        }

        self.apply_command(Command::RemoveIdentity { name }).await
    }

    /// Replaces all policies of one subject.
    pub async fn set_policies(
        &self,
        origin: Option<u64>,
        name: String,
        policies: Vec<Policy>,
    ) -> Result<()> {
        self.check_writable()?;

        if !self.is_raft_leader() {
            return self.forwarder.set_policies(origin, &name, &policies).await;
        }

        self.apply_command(Command::SetPolicies { name, policies }).await
    }

    /// Sets the lifecycle state of a node.
    pub async fn set_node_state(&self, origin: Option<u64>, id: u64, state: &str) -> Result<()> {
        self.check_writable()?;

        NodeState::parse(state)?;

        if !self.is_raft_leader() {
            return self.forwarder.set_node_state(origin, id, state).await;
        }

        self.apply_command(Command::SetNodeState { id, state: state.to_string() }).await
    }

    /// Sets a key/value entry.
    pub async fn set_kv(&self, key: String, value: String) -> Result<()> {
        self.check_writable()?;
        self.apply_command(Command::SetKv { key, value }).await
    }

    /// Deletes a key/value entry.
    pub async fn delete_kv(&self, key: String) -> Result<()> {
        self.check_writable()?;
        self.apply_command(Command::DeleteKv { key }).await
    }

    /// Acquires a named lock until the given deadline.
    pub async fn acquire_lock(
        &self,
        name: String,
        valid_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        self.apply_command(Command::AcquireLock { name, valid_until }).await
    }

    /// Releases a named lock.
    pub async fn release_lock(&self, name: String) -> Result<()> {
        self.check_writable()?;
        self.apply_command(Command::ReleaseLock { name }).await
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Watches raft metrics for leader changes and keeps the forwarder and
    /// the leader flags current.
    fn spawn_leader_tracking(self: Arc<Self>) {
        let mut metrics_rx = self.raft.metrics();
        let mut shutdown_rx = self.shutdown_signal();

        tokio::spawn(async move {
            loop {
                let metrics = metrics_rx.borrow().clone();

                let current_leader = metrics.current_leader;
                let leader_api_addr = current_leader.and_then(|leader_id| {
                    metrics
                        .membership_config
                        .nodes()
                        .find(|(id, _)| **id == leader_id)
                        .and_then(|(_, node)| Self::api_addr(&node.addr).ok())
                });

                match &leader_api_addr {
                    Some(addr) => self.forwarder.set_leader(addr.clone()),
                    None => self.forwarder.set_leader(String::new()),
                }

                {
                    let mut flags = self.leader.lock();
                    flags.has_raft_leader = leader_api_addr.is_some();
                    flags.is_raft_leader = current_leader == Some(self.id);
                }

                if let Some(leader_id) = current_leader {
                    debug!(leader_id, "leader observation");
                }

                tokio::select! {
                    changed = metrics_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
    }

    /// Runs the emergency-leader sentinel on a 1-second ticker.
    fn spawn_sentinel(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_signal();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut sentinel = Sentinel::new(EMERGENCY_THRESHOLD);
            let start = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }

                let stats = self.stats();
                debug!(?stats, "raft stats");

                let last_contact = stats
                    .get("last_contact")
                    .map_or("never", String::as_str);

                match sentinel.observe(last_contact, start.elapsed()) {
                    Some(true) => {
                        warn!("force leadership due to lost contact to leader");
                        self.leader.lock().emergency = true;
                        if let Err(e) = self.trigger_election().await {
                            warn!(error = %e, "forced election failed");
                        }
                    }
                    Some(false) => {
                        warn!("stop forced leadership due to contact to leader");
                        self.leader.lock().emergency = false;
                    }
                    None => {}
                }
            }
        });
    }

    /// Retries joining the configured cluster until it succeeds or the
    /// node shuts down.
    fn spawn_join_loop(self: Arc<Self>, join_address: String, options: ClusterOptions) {
        // Until a leader is observed, all forwarded calls go to the join
        // target.
        if let Ok(api_addr) = Self::api_addr(&join_address) {
            self.forwarder.set_leader(api_addr);
        }

        let mut shutdown_rx = self.shutdown_signal();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));

            let api_address = Self::api_addr(&options.raft_address.to_string())
                .unwrap_or_else(|_| options.raft_address.to_string());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }

                debug!(address = %join_address, "joining cluster");

                let result = self
                    .join(
                        None,
                        options.node_id,
                        &options.raft_address.to_string(),
                        &api_address,
                        &options.username,
                        &options.password,
                    )
                    .await;

                match result {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(error = %e, address = %join_address, "unable to join");
                    }
                }
            }
        });
    }

    /// Shuts the coordinator down. Idempotent.
    pub async fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(node_id = self.id, "shutting down cluster");

        let _ = self.shutdown_tx.send(true);

        if let Some(tx) = self.raft_server_shutdown.lock().take() {
            let _ = tx.send(());
        }

        if let Err(e) = self.raft.shutdown().await {
            warn!(error = %e, "error shutting down raft");
        }
    }
}

/// Maps an openraft client-write error onto the stable error kinds.
fn map_write_error<E>(e: RaftError<RaftNodeId, E>) -> Error
where
    E: std::error::Error
        + openraft::TryAsRef<openraft::error::ForwardToLeader<RaftNodeId, BasicNode>>,
{
    if let Some(forward) = e.forward_to_leader() {
        let hint = forward.leader_node.as_ref().map(|n| n.addr.as_str());
        return Error::not_leader(hint);
    }
    Error::internal(e.to_string())
}

/// Hysteresis state of the emergency-leader sentinel.
///
/// `observe` returns `Some(true)` exactly once when the contact loss
/// crosses the threshold and `Some(false)` exactly once when contact
/// resumes.
struct Sentinel {
    threshold: Duration,
    forced: bool,
    since_reset: Duration,
}

impl Sentinel {
    fn new(threshold: Duration) -> Self {
        Self { threshold, forced: false, since_reset: Duration::ZERO }
    }

    fn observe(&mut self, last_contact: &str, since_start: Duration) -> Option<bool> {
        let lost_for = match parse_contact_stat(last_contact) {
            // "never": no contact since boot, measure from process start
            // relative to the last successful parse.
            None => since_start - self.since_reset,
            Some(d) => {
                self.since_reset = since_start;
                d
            }
        };

        if lost_for > self.threshold && !self.forced {
            self.forced = true;
            Some(true)
        } else if lost_for <= self.threshold && self.forced {
            self.forced = false;
            Some(false)
        } else {
            None
        }
    }
}

/// Parses a `last_contact` stat: `"1.503s"` → duration, `"never"` → `None`.
fn parse_contact_stat(s: &str) -> Option<Duration> {
    if s == "never" {
        return None;
    }
    let seconds: f64 = s.strip_suffix('s')?.parse().ok()?;
    Some(Duration::from_secs_f64(seconds.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_addr_is_port_plus_one() {
        assert_eq!(Cluster::api_addr("127.0.0.1:7000").unwrap(), "127.0.0.1:7001");
        assert!(Cluster::api_addr("garbage").is_err());
        assert!(Cluster::api_addr("127.0.0.1:notaport").is_err());
    }

    #[test]
    fn test_parse_contact_stat() {
        assert_eq!(parse_contact_stat("never"), None);
        assert_eq!(parse_contact_stat("1.500s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_contact_stat("0.000s"), Some(Duration::ZERO));
        assert_eq!(parse_contact_stat("garbage"), None);
    }

    #[test]
    fn test_sentinel_hysteresis() {
        let mut sentinel = Sentinel::new(Duration::from_secs(10));

        // below threshold: nothing
        assert_eq!(sentinel.observe("5.000s", Duration::from_secs(5)), None);
        // crossing: force exactly once
        assert_eq!(sentinel.observe("11.000s", Duration::from_secs(11)), Some(true));
        assert_eq!(sentinel.observe("12.000s", Duration::from_secs(12)), None);
        // contact resumes: release exactly once
        assert_eq!(sentinel.observe("0.100s", Duration::from_secs(13)), Some(false));
        assert_eq!(sentinel.observe("0.100s", Duration::from_secs(14)), None);
    }

    #[test]
    fn test_sentinel_boundary_is_strictly_greater() {
        let mut sentinel = Sentinel::new(Duration::from_secs(10));
        // exactly at the threshold must not trigger
        assert_eq!(sentinel.observe("10.000s", Duration::from_secs(10)), None);
        assert_eq!(sentinel.observe("10.001s", Duration::from_secs(11)), Some(true));
    }

    #[test]
    fn test_sentinel_never_counts_from_start() {
        let mut sentinel = Sentinel::new(Duration::from_secs(10));

        assert_eq!(sentinel.observe("never", Duration::from_secs(3)), None);
        assert_eq!(sentinel.observe("never", Duration::from_secs(9)), None);
        // contact, then silence again: the "never" clock restarts
        assert_eq!(sentinel.observe("0.100s", Duration::from_secs(10)), None);
        assert_eq!(sentinel.observe("never", Duration::from_secs(19)), None);
        assert_eq!(sentinel.observe("never", Duration::from_secs(21)), Some(true));
    }
}
