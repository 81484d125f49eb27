use depot_raft::DepotNodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub raft_id: DepotNodeId,
    pub is_leader: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_leader: Option<DepotNodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<u64>,
}
