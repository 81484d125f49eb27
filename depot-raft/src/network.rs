//! Raft RPC transport over HTTP/JSON.

use crate::types::{
    DepotAppendEntriesRequest, DepotAppendEntriesResponse, DepotInstallSnapshotRequest,
    DepotInstallSnapshotResponse, DepotNodeId, DepotRaftError, DepotTypeConfig, DepotVoteRequest,
    DepotVoteResponse,
};
use openraft::BasicNode;
use openraft::error::InstallSnapshotError;
use openraft::error::NetworkError;
use openraft::error::RPCError;
use openraft::error::RemoteError;
use openraft::error::Unreachable;
use openraft::network::RPCOption;
use openraft::network::RaftNetwork;
use openraft::network::RaftNetworkFactory;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const URI_RAFT_VOTE: &str = "/internal/v1/raft/vote";
pub const URI_RAFT_APPEND: &str = "/internal/v1/raft/append";
pub const URI_RAFT_SNAPSHOT: &str = "/internal/v1/raft/snapshot";

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DepotNetwork {
    client: reqwest::Client,
}

impl DepotNetwork {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client }
    }

    async fn send_rpc<Req, Resp, Err>(
        &self,
        target: DepotNodeId,
        target_node: &BasicNode,
        uri: &str,
        request: Req,
    ) -> std::result::Result<Resp, RPCError<DepotNodeId, BasicNode, Err>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        Err: std::error::Error + DeserializeOwned,
    {
        let url = format!("http://{}{}", target_node.addr, uri);

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                if error.is_connect() {
                    return RPCError::Unreachable(Unreachable::new(&error));
                }

                RPCError::Network(NetworkError::new(&error))
            })?;

        let payload: std::result::Result<Resp, Err> = response
            .json()
            .await
            .map_err(|error| RPCError::Network(NetworkError::new(&error)))?;

        payload.map_err(|error| RPCError::RemoteError(RemoteError::new(target, error)))
    }
}

impl Default for DepotNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftNetworkFactory<DepotTypeConfig> for DepotNetwork {
    type Network = DepotNetworkConnection;

    async fn new_client(&mut self, target: DepotNodeId, node: &BasicNode) -> Self::Network {
        DepotNetworkConnection {
            owner: self.clone(),
            target,
            target_node: node.clone(),
        }
    }
}

pub struct DepotNetworkConnection {
    owner: DepotNetwork,
    target: DepotNodeId,
    target_node: BasicNode,
}

impl RaftNetwork<DepotTypeConfig> for DepotNetworkConnection {
    async fn append_entries(
        &mut self,
        request: DepotAppendEntriesRequest,
        _option: RPCOption,
    ) -> std::result::Result<
        DepotAppendEntriesResponse,
        RPCError<DepotNodeId, BasicNode, DepotRaftError>,
    > {
        self.owner
            .send_rpc(self.target, &self.target_node, URI_RAFT_APPEND, request)
            .await
    }

    async fn install_snapshot(
        &mut self,
        request: DepotInstallSnapshotRequest,
        _option: RPCOption,
    ) -> std::result::Result<
        DepotInstallSnapshotResponse,
        RPCError<DepotNodeId, BasicNode, DepotRaftError<InstallSnapshotError>>,
    > {
        self.owner
            .send_rpc(self.target, &self.target_node, URI_RAFT_SNAPSHOT, request)
            .await
    }

    async fn vote(
        &mut self,
        request: DepotVoteRequest,
        _option: RPCOption,
    ) -> std::result::Result<DepotVoteResponse, RPCError<DepotNodeId, BasicNode, DepotRaftError>>
    {
        self.owner
            .send_rpc(self.target, &self.target_node, URI_RAFT_VOTE, request)
            .await
    }
}
