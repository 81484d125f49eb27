use crate::error::{RaftNodeError, Result};
use crate::leadership::Leadership;
use crate::log_store::SqliteLogStore;
use crate::network::DepotNetwork;
use crate::state_machine::StateMachineStore;
use crate::types::{
    DepotAppendEntriesRequest, DepotAppendEntriesResult, DepotClientWriteError,
    DepotInstallSnapshotRequest, DepotInstallSnapshotResult, DepotNodeId, DepotRaft,
    DepotVoteRequest, DepotVoteResult, node_name_to_raft_id,
};
use depot_core::{
    ArtifactRequest, ArtifactResponse, Catalog, DEFAULT_READ_CACHE_CAPACITY, DepotError,
    ErrorCode, OpType, ReplicatedCommand, now_timestamp, validate_name,
};
use openraft::BasicNode;
use openraft::Config as RaftConfig;
use openraft::Raft;
use openraft::ServerState;
use openraft::SnapshotPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const RAFT_LOG_FILE_NAME: &str = "raft.sqlite3";
pub const SNAPSHOT_DIR_NAME: &str = "snapshots";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftTuning {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub snapshot_logs_since_last: u64,
    pub reconcile_interval_ms: u64,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            snapshot_logs_since_last: 5000,
            reconcile_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub node_id: String,
    pub advertise_addr: String,
    pub data_dir: PathBuf,
    /// Initialize a fresh cluster with this node as the only voter.
    pub bootstrap: bool,
    /// Every configured member; the local node may or may not be listed.
    pub peers: Vec<PeerConfig>,
    pub raft: RaftTuning,
    pub read_cache_capacity: usize,
}

impl ReplicaOptions {
    pub fn new(node_id: impl Into<String>, advertise_addr: impl Into<String>, data_dir: PathBuf) -> Self {
        Self {
            node_id: node_id.into(),
            advertise_addr: advertise_addr.into(),
            data_dir,
            bootstrap: false,
            peers: Vec::new(),
            raft: RaftTuning::default(),
            read_cache_capacity: DEFAULT_READ_CACHE_CAPACITY,
        }
    }

    fn desired_members(&self, local_id: DepotNodeId) -> BTreeMap<DepotNodeId, BasicNode> {
        let mut members: BTreeMap<DepotNodeId, BasicNode> = self
            .peers
            .iter()
            .map(|peer| (node_name_to_raft_id(&peer.node_id), BasicNode::new(&peer.addr)))
            .collect();
        members.insert(local_id, BasicNode::new(&self.advertise_addr));
        members
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub raft_id: DepotNodeId,
    pub is_leader: bool,
    pub current_leader: Option<DepotNodeId>,
    pub leader_addr: Option<String>,
    pub last_applied: Option<u64>,
    pub voters: Vec<DepotNodeId>,
}

/// One replica: the raft instance, its state machine and the leadership
/// watcher.
#[derive(Clone)]
pub struct ReplicaNode {
    node_name: String,
    raft_id: DepotNodeId,
    advertise_addr: String,
    raft: DepotRaft,
    state_machine: Arc<StateMachineStore>,
    leadership: Arc<Leadership>,
    watcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ReplicaNode {
    pub async fn start(options: ReplicaOptions) -> Result<Self> {
        let node_name = options.node_id.trim().to_string();
        if node_name.is_empty() {
            return Err(RaftNodeError::Config("node_id cannot be empty".to_string()));
        }
        let advertise_addr = options.advertise_addr.trim().to_string();
        if advertise_addr.is_empty() {
            return Err(RaftNodeError::Config(
                "advertise_addr cannot be empty".to_string(),
            ));
        }

        let raft_id = node_name_to_raft_id(&node_name);
        std::fs::create_dir_all(&options.data_dir)?;

        let catalog =
            Arc::new(Catalog::open(&options.data_dir, options.read_cache_capacity).await?);
        let state_machine = Arc::new(StateMachineStore::new(
            catalog,
            options.data_dir.join(SNAPSHOT_DIR_NAME),
        )?);
        let log_store = SqliteLogStore::open(options.data_dir.join(RAFT_LOG_FILE_NAME))?;

        let tuning = &options.raft;
        let raft_config = Arc::new(
            RaftConfig {
                cluster_name: "depot".to_string(),
                heartbeat_interval: tuning.heartbeat_interval_ms,
                election_timeout_min: tuning.election_timeout_min_ms,
                election_timeout_max: tuning.election_timeout_max_ms,
                snapshot_policy: SnapshotPolicy::LogsSinceLast(tuning.snapshot_logs_since_last),
                ..Default::default()
            }
            .validate()
            .map_err(|error| RaftNodeError::Config(format!("invalid raft config: {}", error)))?,
        );

        let raft = Raft::new(
            raft_id,
            raft_config,
            DepotNetwork::new(),
            log_store,
            state_machine.clone(),
        )
        .await
        .map_err(|error| RaftNodeError::Raft(format!("failed to start openraft: {}", error)))?;

        let leadership = Leadership::new(
            raft.clone(),
            raft_id,
            options.desired_members(raft_id),
            Duration::from_millis(tuning.reconcile_interval_ms.max(1)),
        );
        let watcher = leadership.spawn_watcher();

        let node = Self {
            node_name,
            raft_id,
            advertise_addr,
            raft,
            state_machine,
            leadership,
            watcher: Arc::new(Mutex::new(Some(watcher))),
        };

        tracing::info!(
            node = %node.node_name,
            raft_id = node.raft_id,
            addr = %node.advertise_addr,
            "depot replica started"
        );

        if options.bootstrap {
            node.initialize_single_node().await?;
        }

        Ok(node)
    }

    pub fn raft_id(&self) -> DepotNodeId {
        self.raft_id
    }

    pub fn raft(&self) -> &DepotRaft {
        &self.raft
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.state_machine.catalog()
    }

    /// Initializes a cluster whose only voter is this node. Peers join later
    /// through reconciliation.
    pub async fn initialize_single_node(&self) -> Result<()> {
        let members = BTreeMap::from([(self.raft_id, BasicNode::new(&self.advertise_addr))]);

        match self.raft.initialize(members).await {
            Ok(()) => {
                tracing::info!("depot raft initialized as single-node cluster");
                Ok(())
            }
            Err(openraft::error::RaftError::APIError(
                openraft::error::InitializeError::NotAllowed(_),
            )) => {
                tracing::info!("depot raft already initialized, skipping initialize");
                Ok(())
            }
            Err(error) => Err(RaftNodeError::Raft(format!(
                "failed to initialize depot raft: {}",
                error
            ))),
        }
    }

    /// Waits until this node is the leader.
    pub async fn wait_for_leadership(&self, within: Duration) -> Result<()> {
        self.raft
            .wait(Some(within))
            .state(ServerState::Leader, "wait for leadership")
            .await
            .map_err(|error| RaftNodeError::Raft(error.to_string()))?;
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        let metrics = self.raft.metrics();
        let current = metrics.borrow();
        current.state == ServerState::Leader && current.current_leader == Some(self.raft_id)
    }

    /// Address of the current leader as known by this replica.
    pub fn leader_hint(&self) -> Option<String> {
        let metrics = self.raft.metrics();
        let current = metrics.borrow();
        let leader = current.current_leader?;
        if leader == self.raft_id {
            return Some(self.advertise_addr.clone());
        }
        current
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.addr.clone())
    }

    /// Leader flag as last observed by the leadership watcher.
    pub fn leadership_flag(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Routes a client request: mutations are replicated, reads are served
    /// from local state.
    pub async fn handle(&self, request: ArtifactRequest) -> ArtifactResponse {
        if request.op_type.is_mutating() {
            self.process(request).await
        } else {
            self.query(&request).await
        }
    }

    /// Submits a mutation through the replicated log and returns the response
    /// produced when the entry is applied.
    pub async fn process(&self, mut request: ArtifactRequest) -> ArtifactResponse {
        if !self.is_leader() {
            return ArtifactResponse::not_leader(self.leader_hint());
        }

        if let Err(error) = validate_name(&request.name) {
            return error.into();
        }
        if request.op_type == OpType::Create && request.created_at.is_none() {
            request.created_at = Some(now_timestamp());
        }

        let command = match ReplicatedCommand::encode(&request) {
            Ok(command) => command,
            Err(DepotError::Serialization(error)) => {
                return ArtifactResponse::error(ErrorCode::ParseToPbFail, error.to_string());
            }
            Err(error) => return error.into(),
        };

        tracing::debug!(command = %command, artifact = %request.id(), "submitting command");

        match self.raft.client_write(command).await {
            Ok(response) => response.data,
            Err(openraft::error::RaftError::APIError(DepotClientWriteError::ForwardToLeader(
                forward,
            ))) => ArtifactResponse::not_leader(forward.leader_node.map(|node| node.addr)),
            Err(error) => ArtifactResponse::error(
                ErrorCode::InternalError,
                format!("raft client_write failed: {}", error),
            ),
        }
    }

    /// Serves a read-only request from this replica's state.
    pub async fn query(&self, request: &ArtifactRequest) -> ArtifactResponse {
        if request.op_type.is_mutating() {
            return ArtifactResponse::error(
                ErrorCode::UnsupportedRequest,
                format!("{} must go through the replicated log", request.op_type),
            );
        }

        match self.catalog().execute(request).await {
            Ok(response) => response,
            Err(error) => error.into(),
        }
    }

    pub fn status(&self) -> NodeStatus {
        let metrics = self.raft.metrics();
        let current = metrics.borrow();

        NodeStatus {
            node_id: self.node_name.clone(),
            raft_id: self.raft_id,
            is_leader: current.state == ServerState::Leader
                && current.current_leader == Some(self.raft_id),
            current_leader: current.current_leader,
            leader_addr: current.current_leader.and_then(|leader| {
                current
                    .membership_config
                    .membership()
                    .get_node(&leader)
                    .map(|node| node.addr.clone())
            }),
            last_applied: current.last_applied.map(|log_id| log_id.index),
            voters: current.membership_config.membership().voter_ids().collect(),
        }
    }

    pub async fn handle_vote(&self, request: DepotVoteRequest) -> DepotVoteResult {
        self.raft.vote(request).await
    }

    pub async fn handle_append_entries(
        &self,
        request: DepotAppendEntriesRequest,
    ) -> DepotAppendEntriesResult {
        self.raft.append_entries(request).await
    }

    pub async fn handle_install_snapshot(
        &self,
        request: DepotInstallSnapshotRequest,
    ) -> DepotInstallSnapshotResult {
        self.raft.install_snapshot(request).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|error| RaftNodeError::Raft(format!("raft shutdown failed: {}", error)))?;

        if let Some(watcher) = self.watcher.lock().await.take()
            && let Err(error) = watcher.await
        {
            tracing::warn!("leadership watcher exited abnormally: {}", error);
        }

        tracing::info!(node = %self.node_name, "depot replica stopped");
        Ok(())
    }
}
