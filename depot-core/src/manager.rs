//! Artifact Manager: one instance per artifact kind.
//!
//! The manager owns the active and tombstone indexes of its kind and keeps
//! them in step with the namespace store. Every mutation validates fully
//! before touching the store, so a rejected request leaves no trace. Paths
//! that need both indexes lock `active` before `tombstones`.

use crate::artifact::{
    Artifact, ArtifactKind, Version, blob_name_aliases, normalize_checksum, validate_ext,
    validate_name,
};
use crate::blob::{BlobStore, md5_hex};
use crate::error::{DepotError, Result};
use crate::index::ArtifactIndex;
use crate::read_cache::{self, ReadCache};
use crate::request::{ArtifactRequest, ArtifactResponse, OpType};
use crate::store::{NamespaceStore, Store};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Files one domain contributes to a snapshot, relative to the snapshot dir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub kind: ArtifactKind,
    pub range_file: String,
    pub blobs: Vec<String>,
}

pub struct ArtifactManager {
    kind: ArtifactKind,
    store: NamespaceStore,
    blobs: BlobStore,
    active: RwLock<ArtifactIndex>,
    tombstones: RwLock<ArtifactIndex>,
    read_cache: ReadCache,
}

impl ArtifactManager {
    pub async fn open(
        kind: ArtifactKind,
        store: &Arc<Store>,
        blob_root: &Path,
        read_cache_capacity: usize,
    ) -> Result<Self> {
        let blobs = BlobStore::new(blob_root.join(kind.as_str()))?;
        let stale = read_cache::purge_stale_links(&blobs.readers_dir())?;
        if stale > 0 {
            tracing::debug!(kind = %kind, stale, "removed stale reader links");
        }

        let manager = Self {
            kind,
            store: store.namespace(kind.namespace()),
            blobs,
            active: RwLock::new(ArtifactIndex::new()),
            tombstones: RwLock::new(ArtifactIndex::new()),
            read_cache: ReadCache::new(read_cache_capacity),
        };
        manager.reload().await?;
        Ok(manager)
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Runs one request against this manager.
    pub async fn execute(&self, request: &ArtifactRequest) -> Result<ArtifactResponse> {
        if request.kind != self.kind {
            return Err(DepotError::InvalidArgument(format!(
                "{} request routed to {} manager",
                request.kind, self.kind
            )));
        }

        let name = request.name.as_str();
        let version = request.version;

        let response = match request.op_type {
            OpType::Create => ArtifactResponse::with_artifact(self.create(request).await?),
            OpType::Upload => ArtifactResponse::with_artifact(self.upload_chunk(request).await?),
            OpType::Remove => ArtifactResponse::with_artifacts(self.remove(name, version).await?),
            OpType::RestoreTombstone => {
                ArtifactResponse::with_artifacts(self.restore(name, version).await?)
            }
            OpType::RemoveTombstone => {
                ArtifactResponse::with_artifacts(self.remove_tombstone(name, version).await?)
            }
            OpType::Info => ArtifactResponse::with_artifact(self.info(name, version).await?),
            OpType::TombstoneInfo => {
                ArtifactResponse::with_artifact(self.tombstone_info(name, version).await?)
            }
            OpType::List => ArtifactResponse::with_artifacts(self.list(&requested_names(request)).await),
            OpType::TombstoneList => {
                ArtifactResponse::with_artifacts(self.tombstone_list(&requested_names(request)).await)
            }
            OpType::ListVersion => ArtifactResponse::with_versions(self.list_versions(name).await?),
            OpType::TombstoneListVersion => {
                ArtifactResponse::with_versions(self.tombstone_list_versions(name).await?)
            }
            OpType::Download => {
                let (artifact, data) = self
                    .download(name, version, request.offset, request.count)
                    .await?;
                let mut response = ArtifactResponse::with_data(data);
                response.artifact = Some(artifact);
                response
            }
        };

        Ok(response)
    }

    pub async fn create(&self, request: &ArtifactRequest) -> Result<Artifact> {
        let name = request.name.as_str();
        let version = require_version(request.version, name)?;
        validate_name(name)?;
        validate_ext(&request.ext)?;
        if request.size < 0 {
            return Err(DepotError::InvalidArgument(format!(
                "size must be >= 0, got {}",
                request.size
            )));
        }
        let checksum = normalize_checksum(&request.checksum)?;

        let mut active = self.active.write().await;
        let tombstones = self.tombstones.read().await;

        let id = format!("{}/{}@{}", self.kind, name, version);
        if tombstones.contains(name, version) {
            return Err(DepotError::AlreadyTombstoned(id));
        }
        if active.contains(name, version) {
            return Err(DepotError::AlreadyExists(id));
        }
        let current = active.max_version(name).max(tombstones.max_version(name));
        if let Some(current) = current
            && version <= current
        {
            return Err(DepotError::VersionNotIncreasing {
                name: name.to_string(),
                requested: version.to_string(),
                current: current.to_string(),
            });
        }
        if self.kind.has_blob() {
            for (other_name, other_ext) in blob_name_aliases(name, &request.ext) {
                let owner = active
                    .get(&other_name, version)
                    .or_else(|| tombstones.get(&other_name, version));
                if let Some(owner) = owner
                    && owner.ext == other_ext
                {
                    return Err(DepotError::AlreadyExists(format!(
                        "blob {} of {} is owned by {}",
                        owner.blob_file_name(),
                        id,
                        owner.id()
                    )));
                }
            }
        }

        let mut artifact = Artifact {
            kind: self.kind,
            name: name.to_string(),
            version,
            content: None,
            size: request.size,
            checksum,
            created_at: request.created_at.unwrap_or_else(now_timestamp),
            ext: request.ext.clone(),
            upload_size: 0,
            finish: false,
            tombstone: false,
            received: Vec::new(),
        };

        if self.kind.has_blob() {
            if artifact.size == 0 {
                verify_checksum(&artifact.checksum, &md5_hex(&[]))?;
                artifact.finish = true;
            }
            self.blobs
                .allocate(&artifact.blob_file_name(), artifact.size as u64)
                .await?;
        } else {
            let content = request.content.clone().ok_or_else(|| {
                DepotError::InvalidArgument(format!("config {} requires inline content", id))
            })?;
            if content.len() as i64 != artifact.size {
                return Err(DepotError::InvalidArgument(format!(
                    "config content is {} bytes, declared size is {}",
                    content.len(),
                    artifact.size
                )));
            }
            verify_checksum(&artifact.checksum, &md5_hex(content.as_bytes()))?;
            artifact.content = Some(content);
            artifact.finish = true;
        }
        if artifact.finish {
            artifact.upload_size = artifact.size;
        }

        if let Err(err) = self.persist(&artifact) {
            if self.kind.has_blob() {
                let _ = self.blobs.remove(&artifact.blob_file_name()).await;
            }
            return Err(err);
        }

        active.insert(artifact.clone());
        tracing::debug!(artifact = %artifact.id(), size = artifact.size, "artifact created");
        Ok(artifact)
    }

    /// Writes one chunk at `request.offset`. Chunks may arrive in any order
    /// and more than once.
    pub async fn upload_chunk(&self, request: &ArtifactRequest) -> Result<Artifact> {
        let name = request.name.as_str();
        let version = require_version(request.version, name)?;
        if !self.kind.has_blob() {
            return Err(DepotError::InvalidArgument(
                "config artifacts carry inline content and take no uploads".to_string(),
            ));
        }

        let mut active = self.active.write().await;
        let Some(current) = active.get(name, version).cloned() else {
            let tombstones = self.tombstones.read().await;
            let id = format!("{}/{}@{}", self.kind, name, version);
            return Err(if tombstones.contains(name, version) {
                DepotError::AlreadyTombstoned(id)
            } else {
                DepotError::NotFound(id)
            });
        };

        if current.finish {
            return Ok(current);
        }

        let len = request.data.len() as i64;
        if request.count > 0 && request.count != len {
            return Err(DepotError::InvalidArgument(format!(
                "count {} does not match chunk length {}",
                request.count, len
            )));
        }
        let end = request
            .offset
            .checked_add(len)
            .filter(|end| request.offset >= 0 && *end <= current.size)
            .ok_or_else(|| {
                DepotError::InvalidArgument(format!(
                    "chunk of {} bytes at offset {} is outside [0, {}) of {}",
                    len,
                    request.offset,
                    current.size,
                    current.id()
                ))
            })?;

        let file_name = current.blob_file_name();
        let mut writer = self.blobs.open_writer(&file_name, current.size as u64).await?;
        writer
            .write_chunk(request.offset as u64, &request.data)
            .await?;
        drop(writer);

        let mut updated = current;
        updated.upload_size = updated.upload_size.max(end);
        updated.mark_received(request.offset, end);
        // upload_size can reach size while earlier chunks are still missing
        if updated.upload_size == updated.size && updated.fully_received() {
            let actual = self.blobs.md5(&file_name).await?;
            verify_checksum(&updated.checksum, &actual)?;
            updated.finish = true;
            updated.received.clear();
        }

        self.persist(&updated)?;
        if updated.finish {
            tracing::info!(artifact = %updated.id(), size = updated.size, "artifact upload finished");
        }
        active.insert(updated.clone());
        Ok(updated)
    }

    /// Moves one version, or every version of `name`, to the tombstone index.
    pub async fn remove(&self, name: &str, version: Option<Version>) -> Result<Vec<Artifact>> {
        validate_name(name)?;
        let mut active = self.active.write().await;
        let mut tombstones = self.tombstones.write().await;

        let targets = select(&active, &tombstones, self.kind, name, version, |found| {
            DepotError::AlreadyTombstoned(found)
        })?;
        let moved: Vec<Artifact> = targets
            .into_iter()
            .map(|mut artifact| {
                artifact.tombstone = true;
                artifact
            })
            .collect();

        self.persist_all(&moved)?;
        for artifact in &moved {
            active.remove(&artifact.name, artifact.version);
            tombstones.insert(artifact.clone());
        }

        tracing::info!(kind = %self.kind, name, count = moved.len(), "artifacts tombstoned");
        Ok(moved)
    }

    /// Inverse of [`ArtifactManager::remove`].
    pub async fn restore(&self, name: &str, version: Option<Version>) -> Result<Vec<Artifact>> {
        validate_name(name)?;
        let mut active = self.active.write().await;
        let mut tombstones = self.tombstones.write().await;

        let targets = select(&tombstones, &active, self.kind, name, version, |found| {
            DepotError::AlreadyExists(found)
        })?;
        let restored: Vec<Artifact> = targets
            .into_iter()
            .map(|mut artifact| {
                artifact.tombstone = false;
                artifact
            })
            .collect();

        self.persist_all(&restored)?;
        for artifact in &restored {
            tombstones.remove(&artifact.name, artifact.version);
            active.insert(artifact.clone());
        }

        tracing::info!(kind = %self.kind, name, count = restored.len(), "artifacts restored");
        Ok(restored)
    }

    /// Erases tombstoned records and their blobs for good.
    pub async fn remove_tombstone(
        &self,
        name: &str,
        version: Option<Version>,
    ) -> Result<Vec<Artifact>> {
        validate_name(name)?;
        let active = self.active.read().await;
        let mut tombstones = self.tombstones.write().await;

        let targets = select(&tombstones, &active, self.kind, name, version, |found| {
            DepotError::InvalidArgument(format!("{} is active, remove it first", found))
        })?;

        self.store
            .mremove(targets.iter().map(|artifact| artifact.key()))?;
        for artifact in &targets {
            tombstones.remove(&artifact.name, artifact.version);
        }

        if self.kind.has_blob() {
            for artifact in &targets {
                self.read_cache.invalidate(&artifact.name, artifact.version).await;
                if let Err(err) = self.blobs.remove(&artifact.blob_file_name()).await {
                    tracing::warn!(
                        artifact = %artifact.id(),
                        error = %err,
                        "failed to remove purged blob"
                    );
                }
            }
        }

        tracing::info!(kind = %self.kind, name, count = targets.len(), "tombstones purged");
        Ok(targets)
    }

    pub async fn info(&self, name: &str, version: Option<Version>) -> Result<Artifact> {
        let active = self.active.read().await;
        active
            .lookup(name, version)
            .cloned()
            .ok_or_else(|| DepotError::NotFound(describe(self.kind, name, version)))
    }

    pub async fn tombstone_info(&self, name: &str, version: Option<Version>) -> Result<Artifact> {
        let tombstones = self.tombstones.read().await;
        tombstones
            .lookup(name, version)
            .cloned()
            .ok_or_else(|| DepotError::NotFound(describe(self.kind, name, version)))
    }

    pub async fn list(&self, names: &[String]) -> Vec<Artifact> {
        self.active.read().await.list(names)
    }

    pub async fn tombstone_list(&self, names: &[String]) -> Vec<Artifact> {
        self.tombstones.read().await.list(names)
    }

    pub async fn list_versions(&self, name: &str) -> Result<Vec<Version>> {
        validate_name(name)?;
        Ok(self.active.read().await.versions(name))
    }

    pub async fn tombstone_list_versions(&self, name: &str) -> Result<Vec<Version>> {
        validate_name(name)?;
        Ok(self.tombstones.read().await.versions(name))
    }

    /// Serves up to `count` bytes from `offset` of a finished artifact.
    pub async fn download(
        &self,
        name: &str,
        version: Option<Version>,
        offset: i64,
        count: i64,
    ) -> Result<(Artifact, Vec<u8>)> {
        if offset < 0 || count < 0 {
            return Err(DepotError::InvalidArgument(format!(
                "offset ({}) and count ({}) must be >= 0",
                offset, count
            )));
        }

        let active = self.active.read().await;
        let artifact = active
            .lookup(name, version)
            .cloned()
            .ok_or_else(|| DepotError::NotFound(describe(self.kind, name, version)))?;

        if !artifact.finish {
            return Err(DepotError::NotFinished(artifact.id()));
        }
        if offset > artifact.size {
            return Err(DepotError::InvalidArgument(format!(
                "offset {} is past the end of {} ({} bytes)",
                offset,
                artifact.id(),
                artifact.size
            )));
        }
        let wanted = count.min(artifact.size - offset) as usize;

        if let Some(content) = &artifact.content {
            let start = offset as usize;
            let data = content.as_bytes()[start..start + wanted].to_vec();
            return Ok((artifact, data));
        }

        let handle = self
            .read_cache
            .get_or_open(
                &artifact.name,
                artifact.version,
                &self.blobs.blob_path(&artifact.blob_file_name()),
                &self.blobs.readers_dir(),
            )
            .await?;
        drop(active);

        let data = tokio::task::spawn_blocking(move || handle.read_at(offset as u64, wanted))
            .await
            .map_err(|err| DepotError::Internal(format!("read task failed: {}", err)))??;
        Ok((artifact, data))
    }

    /// Rebuilds both indexes from the store. Returns `(active, tombstones)`
    /// counts.
    pub async fn reload(&self) -> Result<(usize, usize)> {
        let mut active = self.active.write().await;
        let mut tombstones = self.tombstones.write().await;
        let (fresh_active, fresh_tombstones) = self.scan_indexes()?;
        *active = fresh_active;
        *tombstones = fresh_tombstones;

        tracing::debug!(
            kind = %self.kind,
            active = active.len(),
            tombstones = tombstones.len(),
            "artifact indexes reloaded"
        );
        Ok((active.len(), tombstones.len()))
    }

    /// Dumps the namespace into `{dir}/{kind}.range` and links every blob into
    /// `{dir}/{kind}/`.
    pub async fn export_snapshot(&self, dir: &Path) -> Result<DomainSnapshot> {
        let active = self.active.read().await;
        let tombstones = self.tombstones.read().await;

        let range_file = format!("{}.range", self.kind);
        let range_path = dir.join(&range_file);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.dump(&range_path))
            .await
            .map_err(|err| DepotError::Internal(format!("dump task failed: {}", err)))??;

        let mut blobs = BTreeSet::new();
        if self.kind.has_blob() {
            for artifact in active.iter().chain(tombstones.iter()) {
                let file_name = artifact.blob_file_name();
                if !self.blobs.exists(&file_name) {
                    tracing::warn!(artifact = %artifact.id(), "blob missing during snapshot export");
                    continue;
                }
                let relative = format!("{}/{}", self.kind, file_name);
                self.blobs.link_to(&file_name, &dir.join(&relative)).await?;
                blobs.insert(relative);
            }
        }

        Ok(DomainSnapshot {
            kind: self.kind,
            range_file,
            blobs: blobs.into_iter().collect(),
        })
    }

    /// Replaces this domain's state with the snapshot found in `dir`.
    pub async fn import_snapshot(&self, dir: &Path, domain: &DomainSnapshot) -> Result<()> {
        if domain.kind != self.kind {
            return Err(DepotError::Corrupted(format!(
                "{} snapshot handed to {} manager",
                domain.kind, self.kind
            )));
        }

        let mut active = self.active.write().await;
        let mut tombstones = self.tombstones.write().await;

        let range_path = dir.join(checked_relative(&domain.range_file)?);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            store.clean()?;
            store.load(&range_path)
        })
        .await
        .map_err(|err| DepotError::Internal(format!("load task failed: {}", err)))??;
        let (fresh_active, fresh_tombstones) = self.scan_indexes()?;

        let finished: BTreeMap<String, &str> = fresh_active
            .iter()
            .chain(fresh_tombstones.iter())
            .filter(|artifact| artifact.finish)
            .map(|artifact| (artifact.blob_file_name(), artifact.checksum.as_str()))
            .collect();

        let mut wanted = BTreeSet::new();
        let mut copied = 0;
        for relative in &domain.blobs {
            let source = dir.join(checked_relative(relative)?);
            let file_name = source
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| DepotError::Corrupted(format!("bad blob path {}", relative)))?
                .to_string();
            let expected = finished.get(&file_name).copied();
            if self.blobs.import_from(&source, &file_name, expected).await? {
                copied += 1;
            }
            wanted.insert(file_name);
        }

        let mut removed = 0;
        for file_name in self.blobs.list().await? {
            if !wanted.contains(&file_name) && self.blobs.remove(&file_name).await? {
                removed += 1;
            }
        }

        self.read_cache.clear().await;
        *active = fresh_active;
        *tombstones = fresh_tombstones;

        tracing::info!(
            kind = %self.kind,
            active = active.len(),
            tombstones = tombstones.len(),
            copied,
            removed,
            "domain snapshot imported"
        );
        Ok(())
    }

    fn scan_indexes(&self) -> Result<(ArtifactIndex, ArtifactIndex)> {
        let mut active = ArtifactIndex::new();
        let mut tombstones = ArtifactIndex::new();
        let mut failure = None;

        self.store.scan(&[], |key, value| {
            match serde_json::from_slice::<Artifact>(value) {
                Ok(artifact) if artifact.key() == key => {
                    if artifact.tombstone {
                        tombstones.insert(artifact);
                    } else {
                        active.insert(artifact);
                    }
                    true
                }
                Ok(artifact) => {
                    failure = Some(DepotError::Corrupted(format!(
                        "record of {} stored under a foreign key",
                        artifact.id()
                    )));
                    false
                }
                Err(err) => {
                    failure = Some(err.into());
                    false
                }
            }
        })?;

        match failure {
            Some(err) => Err(err),
            None => Ok((active, tombstones)),
        }
    }

    fn persist(&self, artifact: &Artifact) -> Result<()> {
        let value = serde_json::to_vec(artifact)?;
        self.store.put(&artifact.key(), &value)
    }

    fn persist_all(&self, artifacts: &[Artifact]) -> Result<()> {
        let entries = artifacts
            .iter()
            .map(|artifact| Ok((artifact.key(), serde_json::to_vec(artifact)?)))
            .collect::<Result<Vec<_>>>()?;
        self.store.mput(entries)
    }
}

/// Picks the targets of a remove/restore/purge from `from`. An entry found in
/// `other` instead is reported through `misplaced`.
fn select(
    from: &ArtifactIndex,
    other: &ArtifactIndex,
    kind: ArtifactKind,
    name: &str,
    version: Option<Version>,
    misplaced: impl FnOnce(String) -> DepotError,
) -> Result<Vec<Artifact>> {
    match version {
        Some(version) => match from.get(name, version) {
            Some(artifact) => Ok(vec![artifact.clone()]),
            None if other.contains(name, version) => {
                Err(misplaced(describe(kind, name, Some(version))))
            }
            None => Err(DepotError::NotFound(describe(kind, name, Some(version)))),
        },
        None => {
            let targets = from.artifacts_of(name);
            if targets.is_empty() {
                return Err(DepotError::NotFound(describe(kind, name, None)));
            }
            Ok(targets)
        }
    }
}

fn requested_names(request: &ArtifactRequest) -> Vec<String> {
    let mut names = request.names.clone();
    if !request.name.is_empty() {
        names.push(request.name.clone());
    }
    names
}

fn require_version(version: Option<Version>, name: &str) -> Result<Version> {
    version.ok_or_else(|| DepotError::InvalidArgument(format!("version is required for {}", name)))
}

fn verify_checksum(expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(DepotError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn describe(kind: ArtifactKind, name: &str, version: Option<Version>) -> String {
    match version {
        Some(version) => format!("{}/{}@{}", kind, name, version),
        None => format!("{}/{}", kind, name),
    }
}

fn checked_relative(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    let safe = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !safe || path.is_empty() {
        return Err(DepotError::Corrupted(format!(
            "snapshot path escapes its directory: {}",
            path
        )));
    }
    Ok(relative)
}

pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ErrorCode;

    const VOCAB: &[u8] = b"aaabbbccc";

    async fn open_manager(dir: &Path, kind: ArtifactKind) -> ArtifactManager {
        let store = Store::open(dir.join("store.sqlite3")).unwrap();
        ArtifactManager::open(kind, &store, &dir.join("blobs"), 8)
            .await
            .unwrap()
    }

    fn v(major: u32, minor: u32, patch: u32) -> Version {
        Version::new(major, minor, patch)
    }

    fn create_dict(name: &str, version: Version, data: &[u8]) -> ArtifactRequest {
        let mut request =
            ArtifactRequest::create(ArtifactKind::Dict, name, version, data.len() as i64, md5_hex(data));
        request.ext = "txt".to_string();
        request
    }

    fn chunk(name: &str, version: Version, offset: i64, data: &[u8]) -> ArtifactRequest {
        ArtifactRequest::upload(ArtifactKind::Dict, name, version, offset, data.to_vec())
    }

    #[tokio::test]
    async fn vocab_scenario_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;

        let created = manager.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();
        assert!(!created.finish);
        assert_eq!(created.upload_size, 0);

        let uploaded = manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, VOCAB))
            .await
            .unwrap();
        assert!(uploaded.finish);
        assert_eq!(uploaded.upload_size, 9);

        let (_, data) = manager.download("vocab", None, 0, 100).await.unwrap();
        assert_eq!(data, VOCAB);

        manager.remove("vocab", Some(v(1, 0, 0))).await.unwrap();
        assert!(manager.list(&[]).await.is_empty());
        assert_eq!(
            manager.tombstone_list_versions("vocab").await.unwrap(),
            vec![v(1, 0, 0)]
        );

        manager.restore("vocab", Some(v(1, 0, 0))).await.unwrap();
        let restored = manager.info("vocab", Some(v(1, 0, 0))).await.unwrap();
        assert_eq!(restored, uploaded);
        assert!(manager.tombstone_list(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn versions_must_increase_over_active_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;

        manager.create(&create_dict("vocab", v(1, 2, 0), b"")).await.unwrap();
        manager.remove("vocab", None).await.unwrap();

        let err = manager
            .create(&create_dict("vocab", v(1, 1, 9), b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::VersionNotIncreasing { .. }));
        assert_eq!(err.error_code(), ErrorCode::InputParamError);

        let err = manager
            .create(&create_dict("vocab", v(1, 2, 0), b""))
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::AlreadyTombstoned(_)));

        assert!(manager.list(&[]).await.is_empty());
        assert!(!manager.blobs().exists("vocab.txt.1.1.9"));
        manager.create(&create_dict("vocab", v(1, 3, 0), b"x")).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_create_leaves_first_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;

        manager.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();
        manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, b"aaa"))
            .await
            .unwrap();

        let err = manager
            .create(&create_dict("vocab", v(1, 0, 0), VOCAB))
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::AlreadyExists(_)));

        let info = manager.info("vocab", Some(v(1, 0, 0))).await.unwrap();
        assert_eq!(info.upload_size, 3);
        let blob = manager.blobs().read_all("vocab.txt.1.0.0").await.unwrap();
        assert_eq!(&blob[..3], b"aaa");
    }

    #[tokio::test]
    async fn out_of_order_and_duplicate_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;
        manager.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();

        // overlapping and repeated chunks converge on the same bytes
        for (offset, data) in [(3, &b"bbb"[..]), (0, b"aa"), (0, b"aa"), (2, b"a"), (6, b"ccc")] {
            let artifact = manager
                .upload_chunk(&chunk("vocab", v(1, 0, 0), offset, data))
                .await
                .unwrap();
            assert!(artifact.upload_size <= artifact.size);
        }

        let info = manager.info("vocab", None).await.unwrap();
        assert!(info.finish);

        // uploads after finish never touch the verified bytes
        let again = manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, b"zzz"))
            .await
            .unwrap();
        assert_eq!(again, info);
        let (_, data) = manager.download("vocab", None, 3, 3).await.unwrap();
        assert_eq!(data, b"bbb");
    }

    #[tokio::test]
    async fn checksum_mismatch_is_rejected_and_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;
        manager.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();

        let err = manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, b"aaabbbccd"))
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::ChecksumMismatch { .. }));

        let info = manager.info("vocab", None).await.unwrap();
        assert!(!info.finish);
        assert_eq!(info.upload_size, 0);
        assert!(matches!(
            manager.download("vocab", None, 0, 9).await,
            Err(DepotError::NotFinished(_))
        ));

        // the rejected chunk counts for nothing, so the whole range is resent
        let partial = manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 8, b"c"))
            .await
            .unwrap();
        assert_eq!(partial.upload_size, 9);
        assert!(!partial.finish);

        let fixed = manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, b"aaabbbcc"))
            .await
            .unwrap();
        assert_eq!(fixed.upload_size, 9);
        assert!(fixed.finish);
        assert!(fixed.received.is_empty());
    }

    #[tokio::test]
    async fn tail_chunk_first_finishes_once_gaps_fill() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;
        manager.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();

        let tail = manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 6, b"ccc"))
            .await
            .unwrap();
        assert_eq!(tail.upload_size, 9);
        assert!(!tail.finish);
        assert_eq!(tail.resume_offset(), 0);

        let head = manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, b"aaa"))
            .await
            .unwrap();
        assert!(!head.finish);
        assert_eq!(head.resume_offset(), 3);

        let middle = manager
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 3, b"bbb"))
            .await
            .unwrap();
        assert!(middle.finish);
        assert_eq!(middle.upload_size, 9);

        // progress survives a reopen
        drop(manager);
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;
        let (_, data) = manager.download("vocab", None, 0, 9).await.unwrap();
        assert_eq!(data, VOCAB);
    }

    #[tokio::test]
    async fn overflowing_chunk_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;
        manager.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();

        for offset in [i64::MAX, i64::MAX - 1, -1] {
            let err = manager
                .upload_chunk(&chunk("vocab", v(1, 0, 0), offset, b"zz"))
                .await
                .unwrap_err();
            assert!(matches!(err, DepotError::InvalidArgument(_)), "offset {offset}");
        }

        let info = manager.info("vocab", None).await.unwrap();
        assert_eq!(info.upload_size, 0);
        assert!(info.received.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_blob_name_owned_by_another_record() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;

        manager.create(&create_dict("a", v(1, 0, 0), b"abc")).await.unwrap();
        manager
            .upload_chunk(&chunk("a", v(1, 0, 0), 0, b"abc"))
            .await
            .unwrap();

        let clash = ArtifactRequest::create(ArtifactKind::Dict, "a.txt", v(1, 0, 0), 3, md5_hex(b"xyz"));
        let err = manager.create(&clash).await.unwrap_err();
        assert!(matches!(err, DepotError::AlreadyExists(_)));

        // tombstoned records keep their blob too
        manager.remove("a", None).await.unwrap();
        assert!(manager.create(&clash).await.is_err());
        manager.restore("a", None).await.unwrap();

        let (_, data) = manager.download("a", None, 0, 3).await.unwrap();
        assert_eq!(data, b"abc");

        // another version of the same joined name has its own blob
        manager
            .create(&ArtifactRequest::create(ArtifactKind::Dict, "a.txt", v(2, 0, 0), 0, md5_hex(b"")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn chunk_bounds_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Plugin).await;
        let mut request = create_dict("ranker", v(0, 1, 0), b"0123");
        request.kind = ArtifactKind::Plugin;
        manager.create(&request).await.unwrap();

        let mut past_end = chunk("ranker", v(0, 1, 0), 2, b"234");
        past_end.kind = ArtifactKind::Plugin;
        assert!(matches!(
            manager.upload_chunk(&past_end).await,
            Err(DepotError::InvalidArgument(_))
        ));

        let mut missing = chunk("ranker", v(0, 2, 0), 0, b"0");
        missing.kind = ArtifactKind::Plugin;
        assert!(matches!(
            manager.upload_chunk(&missing).await,
            Err(DepotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn config_content_is_inline() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Config).await;
        let body = "shards: 4\n";

        let mut request =
            ArtifactRequest::create(ArtifactKind::Config, "search", v(1, 0, 0), body.len() as i64, md5_hex(body.as_bytes()));
        request.content = Some(body.to_string());
        let created = manager.create(&request).await.unwrap();
        assert!(created.finish);

        let (_, data) = manager.download("search", None, 8, 10).await.unwrap();
        assert_eq!(data, b"4\n");

        request.version = Some(v(1, 1, 0));
        request.content = Some("shards: 5\n".to_string());
        assert!(matches!(
            manager.create(&request).await,
            Err(DepotError::ChecksumMismatch { .. })
        ));

        let upload = ArtifactRequest::upload(ArtifactKind::Config, "search", v(1, 0, 0), 0, b"x".to_vec());
        assert!(manager.upload_chunk(&upload).await.is_err());
    }

    #[tokio::test]
    async fn remove_all_versions_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;

        for version in [v(1, 0, 0), v(1, 1, 0)] {
            manager.create(&create_dict("vocab", version, b"")).await.unwrap();
        }
        manager.create(&create_dict("stopwords", v(1, 0, 0), b"")).await.unwrap();

        let removed = manager.remove("vocab", None).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|artifact| artifact.tombstone));
        assert_eq!(manager.list(&[]).await.len(), 1);

        assert!(matches!(
            manager.remove("vocab", Some(v(1, 0, 0))).await,
            Err(DepotError::AlreadyTombstoned(_))
        ));
        assert!(matches!(
            manager.remove_tombstone("stopwords", Some(v(1, 0, 0))).await,
            Err(DepotError::InvalidArgument(_))
        ));

        let purged = manager.remove_tombstone("vocab", None).await.unwrap();
        assert_eq!(purged.len(), 2);
        assert!(manager.tombstone_list(&[]).await.is_empty());
        assert!(!manager.blobs().exists("vocab.txt.1.0.0"));

        // purged versions no longer count towards monotonicity
        manager.create(&create_dict("vocab", v(1, 0, 0), b"")).await.unwrap();
    }

    #[tokio::test]
    async fn purge_keeps_index_in_step_when_a_blob_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;

        for version in [v(1, 0, 0), v(1, 1, 0)] {
            manager.create(&create_dict("vocab", version, b"")).await.unwrap();
        }
        manager.remove("vocab", None).await.unwrap();

        // a directory in place of the first blob makes its removal fail
        let blocked = manager.blobs().blob_path("vocab.txt.1.0.0");
        std::fs::remove_file(&blocked).unwrap();
        std::fs::create_dir(&blocked).unwrap();

        let purged = manager.remove_tombstone("vocab", None).await.unwrap();
        assert_eq!(purged.len(), 2);
        assert!(manager.tombstone_list(&[]).await.is_empty());
        assert!(!manager.blobs().exists("vocab.txt.1.1.0"));

        assert_eq!(manager.reload().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn indexes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = open_manager(dir.path(), ArtifactKind::Dict).await;
            manager.create(&create_dict("a", v(1, 0, 0), b"")).await.unwrap();
            manager.create(&create_dict("b", v(1, 0, 0), b"")).await.unwrap();
            manager.remove("b", None).await.unwrap();
        }

        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;
        assert_eq!(manager.list(&[]).await.len(), 1);
        assert_eq!(manager.tombstone_info("b", None).await.unwrap().version, v(1, 0, 0));
        assert_eq!(manager.reload().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn snapshot_export_import_reproduces_state() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = open_manager(source_dir.path(), ArtifactKind::Dict).await;
        source.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();
        source
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, VOCAB))
            .await
            .unwrap();
        source.create(&create_dict("old", v(0, 1, 0), b"xy")).await.unwrap();
        source.remove("old", None).await.unwrap();

        let snapshot_dir = source_dir.path().join("snapshot");
        let domain = source.export_snapshot(&snapshot_dir).await.unwrap();
        assert_eq!(domain.range_file, "dict.range");
        assert_eq!(
            domain.blobs,
            vec!["dict/old.txt.0.1.0".to_string(), "dict/vocab.txt.1.0.0".to_string()]
        );

        let target_dir = tempfile::tempdir().unwrap();
        let target = open_manager(target_dir.path(), ArtifactKind::Dict).await;
        target.create(&create_dict("stale", v(9, 0, 0), b"")).await.unwrap();

        target.import_snapshot(&snapshot_dir, &domain).await.unwrap();
        assert_eq!(target.list(&[]).await, source.list(&[]).await);
        assert_eq!(target.tombstone_list(&[]).await, source.tombstone_list(&[]).await);
        assert!(!target.blobs().exists("stale.txt.9.0.0"));

        let (_, data) = target.download("vocab", None, 0, 9).await.unwrap();
        assert_eq!(data, VOCAB);

        // a second import of the same snapshot is a no-op
        target.import_snapshot(&snapshot_dir, &domain).await.unwrap();
        assert_eq!(target.list(&[]).await, source.list(&[]).await);
    }

    #[tokio::test]
    async fn snapshot_import_replaces_partial_blob_of_same_size() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = open_manager(source_dir.path(), ArtifactKind::Dict).await;
        source.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();
        source
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, VOCAB))
            .await
            .unwrap();
        let snapshot_dir = source_dir.path().join("snapshot");
        let domain = source.export_snapshot(&snapshot_dir).await.unwrap();

        // a lagging replica holds the create and only the first chunk
        let target_dir = tempfile::tempdir().unwrap();
        let target = open_manager(target_dir.path(), ArtifactKind::Dict).await;
        target.create(&create_dict("vocab", v(1, 0, 0), VOCAB)).await.unwrap();
        target
            .upload_chunk(&chunk("vocab", v(1, 0, 0), 0, b"aaa"))
            .await
            .unwrap();
        assert_eq!(
            target.blobs().read_all("vocab.txt.1.0.0").await.unwrap().len(),
            VOCAB.len()
        );

        target.import_snapshot(&snapshot_dir, &domain).await.unwrap();
        let info = target.info("vocab", None).await.unwrap();
        assert!(info.finish);
        assert_eq!(target.blobs().md5("vocab.txt.1.0.0").await.unwrap(), info.checksum);
        let (_, data) = target.download("vocab", None, 0, 9).await.unwrap();
        assert_eq!(data, VOCAB);
    }

    #[tokio::test]
    async fn execute_dispatches_and_checks_kind() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(dir.path(), ArtifactKind::Dict).await;

        let response = manager
            .execute(&create_dict("vocab", v(1, 0, 0), b""))
            .await
            .unwrap();
        assert_eq!(response.artifact.unwrap().version, v(1, 0, 0));

        let mut list = ArtifactRequest::new(OpType::ListVersion, ArtifactKind::Dict, "vocab");
        let response = manager.execute(&list).await.unwrap();
        assert_eq!(response.versions, vec![v(1, 0, 0)]);

        list.kind = ArtifactKind::Plugin;
        assert!(manager.execute(&list).await.is_err());
    }
}
