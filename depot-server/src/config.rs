use depot_core::DEFAULT_READ_CACHE_CAPACITY;
use depot_raft::{PeerConfig, RaftNodeError, RaftTuning, ReplicaOptions, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub bind_addr: String,
    #[serde(default)]
    pub advertise_addr: Option<String>,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub raft: RaftTuning,
    #[serde(default = "default_read_cache_capacity")]
    pub read_cache_capacity: usize,
}

fn default_read_cache_capacity() -> usize {
    DEFAULT_READ_CACHE_CAPACITY
}

impl Config {
    /// Loads a YAML file, then applies `DEPOT_*` environment overrides
    /// (nested keys use `__`, e.g. `DEPOT_RAFT__HEARTBEAT_INTERVAL_MS`).
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("DEPOT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| RaftNodeError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| RaftNodeError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(RaftNodeError::Config("node_id cannot be empty".to_string()));
        }

        normalize_address(&self.bind_addr, "bind_addr")?;
        if let Some(advertise) = &self.advertise_addr {
            normalize_address(advertise, "advertise_addr")?;
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(RaftNodeError::Config("data_dir cannot be empty".to_string()));
        }

        if self.read_cache_capacity == 0 {
            return Err(RaftNodeError::Config(
                "read_cache_capacity must be > 0".to_string(),
            ));
        }

        let raft = &self.raft;
        if raft.heartbeat_interval_ms == 0 {
            return Err(RaftNodeError::Config(
                "raft.heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if raft.election_timeout_min_ms <= raft.heartbeat_interval_ms
            || raft.election_timeout_max_ms <= raft.election_timeout_min_ms
        {
            return Err(RaftNodeError::Config(format!(
                "raft timeouts must satisfy heartbeat ({}) < election_min ({}) < election_max ({})",
                raft.heartbeat_interval_ms, raft.election_timeout_min_ms, raft.election_timeout_max_ms
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id.trim().is_empty() {
                return Err(RaftNodeError::Config(
                    "peer node_id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(peer.node_id.as_str()) {
                return Err(RaftNodeError::Config(format!(
                    "duplicate peer node_id '{}'",
                    peer.node_id
                )));
            }
            normalize_address(&peer.addr, "peer addr")?;
        }

        Ok(())
    }

    /// Address other replicas and clients use to reach this node.
    pub fn advertise_addr(&self) -> &str {
        self.advertise_addr
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&self.bind_addr)
    }

    pub fn to_replica_options(&self) -> ReplicaOptions {
        let mut options = ReplicaOptions::new(
            self.node_id.trim(),
            self.advertise_addr().trim(),
            self.data_dir.clone(),
        );
        options.bootstrap = self.bootstrap;
        options.peers = self.peers.clone();
        options.raft = self.raft.clone();
        options.read_cache_capacity = self.read_cache_capacity;
        options
    }
}

/// Checks a `host:port` string and returns it trimmed.
pub fn normalize_address(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    let (host_raw, port_raw) = trimmed.rsplit_once(':').ok_or_else(|| {
        RaftNodeError::Config(format!("invalid {} '{}': expected host:port", field, trimmed))
    })?;

    let host = host_raw.trim();
    let port = port_raw.trim();
    if host.is_empty() || port.is_empty() {
        return Err(RaftNodeError::Config(format!(
            "invalid {} '{}': expected host:port",
            field, trimmed
        )));
    }

    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(RaftNodeError::Config(format!(
            "invalid {} '{}': expected host:port",
            field, trimmed
        )));
    }

    let parsed_port = port.parse::<u16>().map_err(|_| {
        RaftNodeError::Config(format!("invalid {} '{}': port must be u16", field, trimmed))
    })?;

    Ok(format!("{}:{}", host, parsed_port))
}
