//! The replicated state machine: applies committed artifact commands to the
//! catalog and moves whole-catalog snapshots in and out of openraft.

use crate::snapshot::{SnapshotManifest, SnapshotReader, SnapshotWriter};
use crate::types::{DepotNodeId, DepotTypeConfig};
use depot_core::{ArtifactResponse, Catalog, DepotError, NamespaceStore};
use openraft::BasicNode;
use openraft::Entry;
use openraft::EntryPayload;
use openraft::LogId;
use openraft::RaftSnapshotBuilder;
use openraft::RaftTypeConfig;
use openraft::Snapshot;
use openraft::SnapshotMeta;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::StoredMembership;
use openraft::storage::RaftStateMachine;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Namespace of the store holding the state machine's own bookkeeping.
pub const META_NAMESPACE: u8 = 0x7f;

const META_KEY_LAST_APPLIED_LOG: &[u8] = b"last_applied_log";
const META_KEY_LAST_MEMBERSHIP: &[u8] = b"last_membership";

type AppliedState = (
    Option<LogId<DepotNodeId>>,
    StoredMembership<DepotNodeId, BasicNode>,
);

#[derive(Debug)]
struct StoredSnapshot {
    meta: SnapshotMeta<DepotNodeId, BasicNode>,
    data: Vec<u8>,
}

pub struct StateMachineStore {
    catalog: Arc<Catalog>,
    meta: NamespaceStore,
    snapshot_dir: PathBuf,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
    /// Held for writing while entries are applied or a snapshot is
    /// installed, and for reading while a snapshot is cut, so the applied
    /// log id and the exported catalog always describe the same state.
    apply_lock: RwLock<()>,
}

impl StateMachineStore {
    /// `snapshot_dir` is the scratch area for building and installing
    /// snapshot images.
    pub fn new(catalog: Arc<Catalog>, snapshot_dir: PathBuf) -> crate::error::Result<Self> {
        std::fs::create_dir_all(&snapshot_dir)?;
        let meta = catalog.store().namespace(META_NAMESPACE);

        Ok(Self {
            catalog,
            meta,
            snapshot_dir,
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
            apply_lock: RwLock::new(()),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    fn read_meta_value<T: DeserializeOwned>(&self, key: &[u8]) -> depot_core::Result<Option<T>> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn encode_meta_value<T: Serialize>(
        key: &[u8],
        value: &T,
    ) -> depot_core::Result<(Vec<u8>, Vec<u8>)> {
        Ok((key.to_vec(), serde_json::to_vec(value)?))
    }

    fn read_applied_state(&self) -> depot_core::Result<AppliedState> {
        let last_applied_log = self
            .read_meta_value::<Option<LogId<DepotNodeId>>>(META_KEY_LAST_APPLIED_LOG)?
            .flatten();
        let last_membership = self
            .read_meta_value::<StoredMembership<DepotNodeId, BasicNode>>(
                META_KEY_LAST_MEMBERSHIP,
            )?
            .unwrap_or_default();

        Ok((last_applied_log, last_membership))
    }

    fn write_applied_state(
        &self,
        last_applied_log: &Option<LogId<DepotNodeId>>,
        last_membership: Option<&StoredMembership<DepotNodeId, BasicNode>>,
    ) -> depot_core::Result<()> {
        let mut entries = vec![Self::encode_meta_value(
            META_KEY_LAST_APPLIED_LOG,
            last_applied_log,
        )?];
        if let Some(membership) = last_membership {
            entries.push(Self::encode_meta_value(
                META_KEY_LAST_MEMBERSHIP,
                membership,
            )?);
        }
        self.meta.mput(entries)
    }

    async fn apply_entry(&self, entry: Entry<DepotTypeConfig>) -> depot_core::Result<ArtifactResponse> {
        let log_id = entry.log_id;

        let (response, membership) = match entry.payload {
            EntryPayload::Blank => (ArtifactResponse::success(), None),
            EntryPayload::Normal(command) => {
                let response = match command.decode() {
                    Ok(request) => match self.catalog.execute(&request).await {
                        Ok(response) => response,
                        Err(error) => {
                            debug!("log {} {} rejected: {}", log_id.index, command, error);
                            ArtifactResponse::from(error)
                        }
                    },
                    Err(error) => {
                        warn!("log {} carries an undecodable command: {}", log_id.index, error);
                        ArtifactResponse::from(error)
                    }
                };
                debug!(
                    "applied log {} {} -> {:?}",
                    log_id.index, command, response.error_code
                );
                (response, None)
            }
            EntryPayload::Membership(membership) => (
                ArtifactResponse::success(),
                Some(StoredMembership::new(Some(log_id), membership)),
            ),
        };

        self.write_applied_state(&Some(log_id), membership.as_ref())?;
        Ok(response)
    }

    async fn build_snapshot_bundle(&self) -> depot_core::Result<(SnapshotMeta<DepotNodeId, BasicNode>, Vec<u8>)> {
        let applying = self.apply_lock.read().await;
        let (last_applied_log, last_membership) = self.read_applied_state()?;

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied_log {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let dir = self.snapshot_dir.join(&snapshot_id);
        let writer = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || SnapshotWriter::create(dir))
                .await
                .map_err(|error| DepotError::Internal(error.to_string()))??
        };

        let domains = match self.catalog.export_snapshot(&dir).await {
            Ok(domains) => domains,
            Err(error) => {
                drop(applying);
                remove_dir_quietly(&dir).await;
                return Err(error);
            }
        };
        drop(applying);
        let manifest = SnapshotManifest {
            snapshot_id: snapshot_id.clone(),
            last_applied_log,
            last_membership: last_membership.clone(),
            domains,
        };

        let data = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            for domain in &manifest.domains {
                writer.add_domain(domain)?;
            }
            writer.finish(&manifest)
        })
        .await
        .map_err(|error| DepotError::Internal(error.to_string()))?;
        remove_dir_quietly(&dir).await;
        let data = data?;

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };
        Ok((meta, data))
    }

    async fn install_snapshot_bundle(
        &self,
        meta: &SnapshotMeta<DepotNodeId, BasicNode>,
        data: &[u8],
    ) -> depot_core::Result<()> {
        let _applying = self.apply_lock.write().await;
        let staging = self
            .snapshot_dir
            .join(format!("install-{}", meta.snapshot_id));

        let reader = {
            let bundle = data.to_vec();
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || SnapshotReader::unpack(&bundle, staging))
                .await
                .map_err(|error| DepotError::Internal(error.to_string()))?
        };

        let result = match reader {
            Ok(reader) => {
                self.catalog
                    .import_snapshot(reader.dir(), &reader.manifest().domains)
                    .await
            }
            Err(error) => Err(error),
        };
        remove_dir_quietly(&staging).await;
        result?;

        self.write_applied_state(&meta.last_log_id, Some(&meta.last_membership))
    }
}

async fn remove_dir_quietly(dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(dir).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!("failed to remove snapshot dir {}: {}", dir.display(), error);
    }
}

impl RaftSnapshotBuilder<DepotTypeConfig> for Arc<StateMachineStore> {
    async fn build_snapshot(
        &mut self,
    ) -> std::result::Result<Snapshot<DepotTypeConfig>, StorageError<DepotNodeId>> {
        let (meta, data) = self
            .build_snapshot_bundle()
            .await
            .map_err(|error| StorageIOError::read_state_machine(&error))?;

        info!(
            "built snapshot {} ({} bytes)",
            meta.snapshot_id,
            data.len()
        );

        {
            let mut current = self.current_snapshot.write().await;
            *current = Some(StoredSnapshot {
                meta: meta.clone(),
                data: data.clone(),
            });
        }

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<DepotTypeConfig> for Arc<StateMachineStore> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<AppliedState, StorageError<DepotNodeId>> {
        let state = self
            .read_applied_state()
            .map_err(|error| StorageIOError::read_state_machine(&error))?;
        Ok(state)
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> std::result::Result<Vec<ArtifactResponse>, StorageError<DepotNodeId>>
    where
        I: IntoIterator<Item = Entry<DepotTypeConfig>> + Send,
    {
        let _applying = self.apply_lock.write().await;
        let mut responses = Vec::new();
        for entry in entries {
            let response = self
                .apply_entry(entry)
                .await
                .map_err(|error| StorageIOError::write_state_machine(&error))?;
            responses.push(response);
        }
        Ok(responses)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<
        Box<<DepotTypeConfig as RaftTypeConfig>::SnapshotData>,
        StorageError<DepotNodeId>,
    > {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<DepotNodeId, BasicNode>,
        snapshot: Box<<DepotTypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> std::result::Result<(), StorageError<DepotNodeId>> {
        let raw = snapshot.into_inner();

        self.install_snapshot_bundle(meta, &raw)
            .await
            .map_err(|error| StorageIOError::read_snapshot(Some(meta.signature()), &error))?;

        info!(
            "installed snapshot {} ({} bytes)",
            meta.snapshot_id,
            raw.len()
        );

        {
            let mut current = self.current_snapshot.write().await;
            *current = Some(StoredSnapshot {
                meta: meta.clone(),
                data: raw,
            });
        }

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<DepotTypeConfig>>, StorageError<DepotNodeId>> {
        let current = self.current_snapshot.read().await;
        match &*current {
            Some(snapshot) => Ok(Some(Snapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }
}
