use crate::config::Config;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use depot_raft::{
    RaftNodeError, ReplicaNode, Result, URI_RAFT_APPEND, URI_RAFT_SNAPSHOT, URI_RAFT_VOTE,
};
use std::sync::Arc;
use tokio::net::TcpListener;

mod external;
mod internal;
mod types;

use external::{health, v1_artifact};
use internal::{internal_raft_append, internal_raft_snapshot, internal_raft_vote};
pub use types::*;

pub const URI_ARTIFACT: &str = "/api/v1/artifact";

/// Artifact requests carry one chunk each; leave headroom for base64.
const ARTIFACT_BODY_LIMIT: usize = 16 * 1024 * 1024;

pub struct ServerState {
    pub(crate) node: ReplicaNode,
}

pub fn build_router(node: ReplicaNode) -> Router {
    let state = Arc::new(ServerState { node });

    let raft_routes = Router::new()
        .route(URI_RAFT_VOTE, post(internal_raft_vote))
        .route(URI_RAFT_APPEND, post(internal_raft_append))
        .route(URI_RAFT_SNAPSHOT, post(internal_raft_snapshot))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/health", get(health))
        .route(
            URI_ARTIFACT,
            post(v1_artifact).layer(DefaultBodyLimit::max(ARTIFACT_BODY_LIMIT)),
        )
        .merge(raft_routes)
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    let node = ReplicaNode::start(config.to_replica_options()).await?;

    tracing::info!(
        "Depot listening on {} (advertised as {})",
        config.bind_addr,
        config.advertise_addr()
    );

    let app = build_router(node.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for shutdown signal: {}", error);
            }
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|error| RaftNodeError::Http(error.to_string()));

    node.shutdown().await?;
    served
}
