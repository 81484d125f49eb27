use depot_core::{ArtifactResponse, ReplicatedCommand};
use openraft::BasicNode;
use openraft::Raft;
use openraft::error::InstallSnapshotError;
use openraft::raft::AppendEntriesRequest;
use openraft::raft::AppendEntriesResponse;
use openraft::raft::ClientWriteResponse;
use openraft::raft::InstallSnapshotRequest;
use openraft::raft::InstallSnapshotResponse;
use openraft::raft::VoteRequest;
use openraft::raft::VoteResponse;
use sha2::Digest;
use sha2::Sha256;
use std::io::Cursor;

pub type DepotNodeId = u64;

openraft::declare_raft_types!(
    pub DepotTypeConfig:
        D = ReplicatedCommand,
        R = ArtifactResponse,
        Node = BasicNode,
);

pub type DepotRaft = Raft<DepotTypeConfig>;

pub type DepotRaftError<E = openraft::error::Infallible> = openraft::error::RaftError<DepotNodeId, E>;
pub type DepotClientWriteError = openraft::error::ClientWriteError<DepotNodeId, BasicNode>;

pub type DepotVoteRequest = VoteRequest<DepotNodeId>;
pub type DepotVoteResponse = VoteResponse<DepotNodeId>;
pub type DepotAppendEntriesRequest = AppendEntriesRequest<DepotTypeConfig>;
pub type DepotAppendEntriesResponse = AppendEntriesResponse<DepotNodeId>;
pub type DepotInstallSnapshotRequest = InstallSnapshotRequest<DepotTypeConfig>;
pub type DepotInstallSnapshotResponse = InstallSnapshotResponse<DepotNodeId>;

pub type DepotVoteResult = std::result::Result<DepotVoteResponse, DepotRaftError>;
pub type DepotAppendEntriesResult =
    std::result::Result<DepotAppendEntriesResponse, DepotRaftError>;
pub type DepotInstallSnapshotResult =
    std::result::Result<DepotInstallSnapshotResponse, DepotRaftError<InstallSnapshotError>>;
pub type DepotClientWriteResult = std::result::Result<
    ClientWriteResponse<DepotTypeConfig>,
    DepotRaftError<DepotClientWriteError>,
>;

/// Stable raft id derived from a node's configured name.
pub fn node_name_to_raft_id(node_id: &str) -> DepotNodeId {
    let digest = Sha256::digest(node_id.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[0..8]);
    let mut value = u64::from_be_bytes(bytes);

    if value == 0 {
        value = 1;
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_id_is_stable_and_nonzero() {
        assert_eq!(node_name_to_raft_id("depot-1"), node_name_to_raft_id("depot-1"));
        assert_ne!(node_name_to_raft_id("depot-1"), node_name_to_raft_id("depot-2"));
        assert_ne!(node_name_to_raft_id(""), 0);
    }
}
