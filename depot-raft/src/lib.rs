//! Depot Raft - replicates artifact mutations across depot replicas
//!
//! openraft supplies election and log replication; this crate provides the
//! SQLite raft log, the HTTP network, the state machine that applies artifact
//! commands to the catalog, and the replica node that gates writes on
//! leadership.

pub mod error;
pub mod leadership;
pub mod log_store;
pub mod network;
pub mod node;
pub mod snapshot;
pub mod state_machine;
pub mod types;

pub use error::{RaftNodeError, Result};
pub use leadership::{Leadership, reconcile_once};
pub use log_store::SqliteLogStore;
pub use network::{DepotNetwork, URI_RAFT_APPEND, URI_RAFT_SNAPSHOT, URI_RAFT_VOTE};
pub use node::{NodeStatus, PeerConfig, RaftTuning, ReplicaNode, ReplicaOptions};
pub use snapshot::{MANIFEST_FILE, SnapshotManifest, SnapshotReader, SnapshotWriter};
pub use state_machine::{META_NAMESPACE, StateMachineStore};
pub use types::{
    DepotAppendEntriesRequest, DepotAppendEntriesResult, DepotInstallSnapshotRequest,
    DepotInstallSnapshotResult, DepotNodeId, DepotRaft, DepotTypeConfig, DepotVoteRequest,
    DepotVoteResult, node_name_to_raft_id,
};
