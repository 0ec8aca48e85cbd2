//! HTTP-based network layer for Raft communication.
//!
//! The raft protocol runs over plain HTTP/JSON on `raft_address`: every
//! node serves the three raft RPCs with axum and dials its peers with a
//! pooled reqwest client. See [`server`] for the receiving side.

pub mod server;

use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::types::{RaftNodeId, TypeConfig};

pub use server::{serve_raft, ContactTracker};

/// Connect and per-RPC timeout of the raft transport.
pub const RAFT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory creating HTTP connections to raft peers.
#[derive(Clone)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    /// Creates a factory with a shared connection pool.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(RAFT_RPC_TIMEOUT)
            .timeout(RAFT_RPC_TIMEOUT)
            .pool_max_idle_per_host(3)
            .build()
            .expect("reqwest client");
        Self { client }
    }
}

impl Default for HttpNetworkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: RaftNodeId, node: &BasicNode) -> Self::Network {
        HttpNetwork { target, target_addr: node.addr.clone(), client: self.client.clone() }
    }
}

/// HTTP connection to one raft peer.
pub struct HttpNetwork {
    target: RaftNodeId,
    target_addr: String,
    client: reqwest::Client,
}

impl HttpNetwork {
    /// Sends one RPC and decodes the peer's `Result` payload.
    async fn send<Req, Resp, E>(
        &self,
        endpoint: &str,
        req: &Req,
    ) -> Result<Resp, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, E>>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let url = format!("http://{}/raft/{}", self.target_addr, endpoint);
        debug!(target = self.target, url = %url, "raft rpc");

        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let result: Result<Resp, RaftError<RaftNodeId, E>> = response
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>,
    > {
        self.send("append", &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        self.send("snapshot", &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        self.send("vote", &rpc).await
    }
}
