//! HTTP transport for the transfer client.

use crate::server::URI_ARTIFACT;
use async_trait::async_trait;
use depot_core::{ArtifactEndpoint, ArtifactRequest, ArtifactResponse, DepotError, ErrorCode, Result};
use std::time::Duration;
use tokio::sync::RwLock;

const MAX_LEADER_REDIRECTS: usize = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends artifact requests to one server and follows `NOT_LEADER` hints for
/// mutations. The last leader seen is remembered for later calls.
pub struct HttpEndpoint {
    client: reqwest::Client,
    server: RwLock<String>,
}

impl HttpEndpoint {
    pub fn new(server: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            server: RwLock::new(server.into()),
        }
    }

    pub async fn server(&self) -> String {
        self.server.read().await.clone()
    }

    async fn post(&self, server: &str, request: &ArtifactRequest) -> Result<ArtifactResponse> {
        let url = format!("http://{}{}", server, URI_ARTIFACT);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|error| DepotError::Http(format!("{} unreachable: {}", server, error)))?;

        let status = response.status();
        response.json::<ArtifactResponse>().await.map_err(|error| {
            DepotError::Http(format!(
                "{} returned an unreadable response (status {}): {}",
                server, status, error
            ))
        })
    }
}

#[async_trait]
impl ArtifactEndpoint for HttpEndpoint {
    async fn call(&self, request: ArtifactRequest) -> Result<ArtifactResponse> {
        let mut server = self.server().await;

        for _attempt in 0..=MAX_LEADER_REDIRECTS {
            let response = self.post(&server, &request).await?;
            if response.error_code != ErrorCode::NotLeader {
                return Ok(response);
            }

            match response.leader_hint.as_deref() {
                Some(leader) if !leader.is_empty() && leader != server => {
                    tracing::info!(from = %server, to = %leader, "following leader hint");
                    server = leader.to_string();
                    *self.server.write().await = server.clone();
                }
                _ => return Ok(response),
            }
        }

        Err(DepotError::NotLeader {
            leader_hint: Some(server),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use depot_core::{ArtifactKind, TransferClient, Version};
    use depot_raft::{ReplicaNode, ReplicaOptions};
    use tokio::net::TcpListener;

    async fn start_replica(dir: &std::path::Path) -> (ReplicaNode, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut options = ReplicaOptions::new("http-test", addr.clone(), dir.to_path_buf());
        options.bootstrap = true;
        options.raft.heartbeat_interval_ms = 50;
        options.raft.election_timeout_min_ms = 150;
        options.raft.election_timeout_max_ms = 300;
        let node = ReplicaNode::start(options).await.unwrap();
        node.wait_for_leadership(Duration::from_secs(5)).await.unwrap();

        let app = build_router(node.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (node, addr)
    }

    #[tokio::test]
    async fn upload_and_download_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let (node, addr) = start_replica(dir.path()).await;

        let client = TransferClient::new(HttpEndpoint::new(addr)).with_chunk_size(4);
        let version = Version::new(1, 0, 0);
        let uploaded = client
            .upload_bytes(ArtifactKind::Dict, "vocab", version, "", b"aaabbbccc")
            .await
            .unwrap();
        assert!(uploaded.finish);

        let (artifact, data) = client
            .download_bytes(ArtifactKind::Dict, "vocab", None)
            .await
            .unwrap();
        assert_eq!(artifact.version, version);
        assert_eq!(data, b"aaabbbccc");

        let target = dir.path().join("out/vocab.bin");
        client
            .download_to(ArtifactKind::Dict, "vocab", Some(version), &target)
            .await
            .unwrap();
        assert_eq!(std::fs::read(target).unwrap(), b"aaabbbccc");

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_is_an_http_error() {
        let endpoint = HttpEndpoint::new("127.0.0.1:1");
        let request = ArtifactRequest::new(depot_core::OpType::List, ArtifactKind::Plugin, "");
        assert!(matches!(
            endpoint.call(request).await,
            Err(DepotError::Http(_))
        ));
    }
}
