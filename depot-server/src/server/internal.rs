use super::ServerState;
use axum::{Json, extract::State, response::IntoResponse};
use depot_raft::{DepotAppendEntriesRequest, DepotInstallSnapshotRequest, DepotVoteRequest};
use std::sync::Arc;

pub(crate) async fn internal_raft_vote(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DepotVoteRequest>,
) -> impl IntoResponse {
    Json(state.node.handle_vote(request).await)
}

pub(crate) async fn internal_raft_append(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DepotAppendEntriesRequest>,
) -> impl IntoResponse {
    Json(state.node.handle_append_entries(request).await)
}

pub(crate) async fn internal_raft_snapshot(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DepotInstallSnapshotRequest>,
) -> impl IntoResponse {
    Json(state.node.handle_install_snapshot(request).await)
}
