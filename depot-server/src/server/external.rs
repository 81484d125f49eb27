use super::{HealthResponse, ServerState};
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use depot_core::{ArtifactRequest, ArtifactResponse, ErrorCode};
use std::sync::Arc;

pub(crate) async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let status = state.node.status();

    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: status.node_id,
        raft_id: status.raft_id,
        is_leader: status.is_leader,
        current_leader: status.current_leader,
        leader_addr: status.leader_addr,
        last_applied: status.last_applied,
    })
}

/// Entry point for every artifact operation. Business failures travel in the
/// response body; only an unparseable request gets a non-200 status.
pub(crate) async fn v1_artifact(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let request: ArtifactRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ArtifactResponse::error(
                    ErrorCode::ParseFromPbFail,
                    format!("invalid artifact request: {}", error),
                )),
            )
                .into_response();
        }
    };

    let op = request.op_type;
    let id = request.id();
    let response = state.node.handle(request).await;
    if !response.is_success() {
        tracing::debug!(
            op = %op,
            artifact = %id,
            code = ?response.error_code,
            "artifact request failed: {}",
            response.error_message
        );
    }

    (StatusCode::OK, Json(response)).into_response()
}
