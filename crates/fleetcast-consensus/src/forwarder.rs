//! Follower-to-leader forwarding.
//!
//! Every mutation submitted to a follower is forwarded to the current
//! leader over the cluster API. The forwarder snapshots the leader address
//! under a read lock per call, injects the `origin` (the node id of the
//! ultimate caller, defaulting to the local node), and dispatches over a
//! pooled HTTP client. If the leader changes mid-flight the call fails and
//! the caller decides whether to retry.

use std::time::Duration;

use fleetcast_core::process::{ProcessConfig, ProcessId};
use fleetcast_core::{Error, ErrorKind, Result};
use fleetcast_iam::access::Policy;
use fleetcast_iam::user::User;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Request to join the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// Id of the joining node.
    pub id: u64,
    /// Raft address of the joining node.
    pub raft_address: String,
    /// Cluster API address of the joining node.
    pub api_address: String,
    /// Cluster API username of the joining node.
    pub username: String,
    /// Cluster API password of the joining node.
    pub password: String,
}

/// Request to leave the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// Id of the leaving node.
    pub id: u64,
}

/// Request to add a process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddProcessRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// The definition.
    pub config: ProcessConfig,
}

/// Request to update a process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProcessRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// Domain of the definition being replaced.
    pub domain: String,
    /// The replacement definition.
    pub config: ProcessConfig,
}

/// Request to relay a process command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCommandRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// Domain of the process.
    pub domain: String,
    /// One of `start`, `stop`, `suspend`, `resume`.
    pub command: String,
}

/// Request to set or delete one metadata key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMetadataRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// Domain of the process.
    pub domain: String,
    /// New value; `None` deletes the key.
    pub value: Option<Value>,
}

/// Request to add or update an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// The identity.
    pub identity: User,
}

/// Request to replace the policies of one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPoliciesRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// The complete new policy set.
    pub policies: Vec<Policy>,
}

/// Request to set the lifecycle state of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetNodeStateRequest {
    /// Node id of the ultimate caller.
    pub origin: u64,
    /// The new state string.
    pub state: String,
}

/// Error payload of the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable error kind string.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// Forwards mutations from this node to the current leader.
pub struct Forwarder {
    id: u64,
    username: String,
    password: String,
    leader: RwLock<String>,
    client: reqwest::Client,
}

impl Forwarder {
    /// Creates a forwarder for the node with the given id and cluster API
    /// credentials.
    #[must_use]
    pub fn new(id: u64, username: String, password: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");

        Self { id, username, password, leader: RwLock::new(String::new()), client }
    }

    /// Sets the leader's cluster API address.
    pub fn set_leader(&self, address: String) {
        let mut leader = self.leader.write();
        if *leader == address {
            return;
        }
        debug!(address = %address, "setting leader address");
        *leader = address;
    }

    /// Returns `true` if a leader address is known.
    #[must_use]
    pub fn has_leader(&self) -> bool {
        !self.leader.read().is_empty()
    }

    /// Returns the current leader address, if known.
    #[must_use]
    pub fn leader_address(&self) -> Option<String> {
        let leader = self.leader.read();
        if leader.is_empty() {
            None
        } else {
            Some(leader.clone())
        }
    }

    fn origin(&self, origin: Option<u64>) -> u64 {
        origin.unwrap_or(self.id)
    }

    fn url(&self, address: Option<&str>, path: &str) -> Result<String> {
        let address = match address {
            Some(a) => a.to_string(),
            None => {
                let leader = self.leader.read();
                if leader.is_empty() {
                    return Err(Error::not_leader(None));
                }
                leader.clone()
            }
        };
        Ok(format!("http://{address}/v1/{path}"))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status.is_client_error() {
            let payload: ErrorPayload = response
                .json()
                .await
                .unwrap_or(ErrorPayload { kind: "Internal".to_string(), message: String::new() });
            return Err(Error::new(ErrorKind::from_str_lossy(&payload.kind), payload.message));
        }

        Err(Error::new(ErrorKind::Upstream, format!("leader returned {status}")))
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.url(None, path)?;
        let response = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn post<T: Serialize>(&self, address: Option<&str>, path: &str, body: &T) -> Result<()> {
        let url = self.url(address, path)?;
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete(&self, path: &str, origin: u64) -> Result<()> {
        let url = self.url(None, path)?;
        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("origin", origin.to_string())])
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    /// Forwards a join request, either to the known leader or to an
    /// explicit peer address (used while joining a cluster for the first
    /// time, before any leader is known).
    pub async fn join(
        &self,
        origin: Option<u64>,
        peer_address: Option<&str>,
        id: u64,
        raft_address: &str,
        api_address: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let request = JoinRequest {
            origin: self.origin(origin),
            id,
            raft_address: raft_address.to_string(),
            api_address: api_address.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        };
        self.post(peer_address, "join", &request).await
    }

    /// Forwards a leave request for the given node.
    pub async fn leave(&self, origin: Option<u64>, id: u64) -> Result<()> {
        let request = LeaveRequest { origin: self.origin(origin), id };
        self.post(None, "leave", &request).await
    }

    /// Fetches the current FSM snapshot blob from the leader.
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        let url = self.url(None, "snapshot")?;
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        let response = Self::check(response).await?;
        let bytes =
            response.bytes().await.map_err(|e| Error::new(ErrorKind::Upstream, e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Asks the node at `address` to start a local election.
    pub async fn transfer_leadership(&self, address: &str) -> Result<()> {
        let url = self.url(Some(address), "transfer")?;
        let response = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&serde_json::json!({ "origin": self.id }))
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    /// Forwards an add-process mutation.
    pub async fn add_process(&self, origin: Option<u64>, config: &ProcessConfig) -> Result<()> {
        let request = AddProcessRequest { origin: self.origin(origin), config: config.clone() };
        self.post(None, "process", &request).await
    }

    /// Forwards an update-process mutation.
    pub async fn update_process(
        &self,
        origin: Option<u64>,
        id: &ProcessId,
        config: &ProcessConfig,
    ) -> Result<()> {
        let request = UpdateProcessRequest {
            origin: self.origin(origin),
            domain: id.domain.clone(),
            config: config.clone(),
        };
        self.put(&format!("process/{}", id.id), &request).await
    }

    /// Forwards a remove-process mutation.
    pub async fn remove_process(&self, origin: Option<u64>, id: &ProcessId) -> Result<()> {
        self.delete(
            &format!("process/{}?domain={}", id.id, id.domain),
            self.origin(origin),
        )
        .await
    }

    /// Forwards a process command relay.
    pub async fn set_process_command(
        &self,
        origin: Option<u64>,
        id: &ProcessId,
        command: &str,
    ) -> Result<()> {
        let request = ProcessCommandRequest {
            origin: self.origin(origin),
            domain: id.domain.clone(),
            command: command.to_string(),
        };
        self.put(&format!("process/{}/command", id.id), &request).await
    }

    /// Forwards a set-process-metadata mutation.
    pub async fn set_process_metadata(
        &self,
        origin: Option<u64>,
        id: &ProcessId,
        key: &str,
        value: Option<Value>,
    ) -> Result<()> {
        let request =
            ProcessMetadataRequest { origin: self.origin(origin), domain: id.domain.clone(), value };
        self.put(&format!("process/{}/metadata/{key}", id.id), &request).await
    }

    /// Forwards an add-identity mutation.
    pub async fn add_identity(&self, origin: Option<u64>, identity: &User) -> Result<()> {
        let request = IdentityRequest { origin: self.origin(origin), identity: identity.clone() };
        self.post(None, "iam/user", &request).await
    }

    /// Forwards an update-identity mutation.
    pub async fn update_identity(
        &self,
        origin: Option<u64>,
        name: &str,
        identity: &User,
    ) -> Result<()> {
        let request = IdentityRequest { origin: self.origin(origin), identity: identity.clone() };
        self.put(&format!("iam/user/{name}"), &request).await
    }

    /// Forwards a remove-identity mutation.
    pub async fn remove_identity(&self, origin: Option<u64>, name: &str) -> Result<()> {
        self.delete(&format!("iam/user/{name}"), self.origin(origin)).await
    }

    /// Forwards a set-policies mutation.
    pub async fn set_policies(
        &self,
        origin: Option<u64>,
        name: &str,
        policies: &[Policy],
    ) -> Result<()> {
        let request =
            SetPoliciesRequest { origin: self.origin(origin), policies: policies.to_vec() };
        self.put(&format!("iam/user/{name}/policy"), &request).await
    }

    /// Forwards a set-node-state mutation.
    pub async fn set_node_state(&self, origin: Option<u64>, id: u64, state: &str) -> Result<()> {
        let request =
            SetNodeStateRequest { origin: self.origin(origin), state: state.to_string() };
        self.put(&format!("node/{id}/state"), &request).await
    }
}

fn map_send_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout("forward to leader timed out")
    } else {
        Error::new(ErrorKind::Upstream, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_address_snapshot() {
        let forwarder = Forwarder::new(1, "u".to_string(), "p".to_string());
        assert!(!forwarder.has_leader());
        assert!(forwarder.leader_address().is_none());

        forwarder.set_leader("127.0.0.1:7001".to_string());
        assert!(forwarder.has_leader());
        assert_eq!(forwarder.leader_address().unwrap(), "127.0.0.1:7001");
    }

    #[test]
    fn test_no_leader_is_not_leader_error() {
        let forwarder = Forwarder::new(1, "u".to_string(), "p".to_string());
        let err = forwarder.url(None, "process").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotLeader);
    }

    #[test]
    fn test_origin_defaults_to_local_id() {
        let forwarder = Forwarder::new(7, "u".to_string(), "p".to_string());
        assert_eq!(forwarder.origin(None), 7);
        assert_eq!(forwarder.origin(Some(3)), 3);
    }
}
