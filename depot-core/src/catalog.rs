use crate::artifact::ArtifactKind;
use crate::error::{DepotError, Result};
use crate::manager::{ArtifactManager, DomainSnapshot};
use crate::request::{ArtifactRequest, ArtifactResponse};
use crate::store::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STORE_FILE_NAME: &str = "depot.sqlite3";
pub const BLOB_DIR_NAME: &str = "blobs";

/// The per-process set of artifact managers, one per kind, sharing a single
/// store.
pub struct Catalog {
    store: Arc<Store>,
    config: ArtifactManager,
    dict: ArtifactManager,
    plugin: ArtifactManager,
}

impl Catalog {
    /// Opens (or creates) the store and blob directories under `data_dir`.
    pub async fn open(data_dir: &Path, read_cache_capacity: usize) -> Result<Self> {
        let store = Store::open(data_dir.join(STORE_FILE_NAME))?;
        Self::with_store(store, &data_dir.join(BLOB_DIR_NAME), read_cache_capacity).await
    }

    pub async fn with_store(
        store: Arc<Store>,
        blob_root: &Path,
        read_cache_capacity: usize,
    ) -> Result<Self> {
        let config =
            ArtifactManager::open(ArtifactKind::Config, &store, blob_root, read_cache_capacity)
                .await?;
        let dict =
            ArtifactManager::open(ArtifactKind::Dict, &store, blob_root, read_cache_capacity)
                .await?;
        let plugin =
            ArtifactManager::open(ArtifactKind::Plugin, &store, blob_root, read_cache_capacity)
                .await?;

        Ok(Self {
            store,
            config,
            dict,
            plugin,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn manager(&self, kind: ArtifactKind) -> &ArtifactManager {
        match kind {
            ArtifactKind::Config => &self.config,
            ArtifactKind::Dict => &self.dict,
            ArtifactKind::Plugin => &self.plugin,
        }
    }

    pub fn managers(&self) -> impl Iterator<Item = &ArtifactManager> {
        ArtifactKind::ALL.into_iter().map(|kind| self.manager(kind))
    }

    pub async fn execute(&self, request: &ArtifactRequest) -> Result<ArtifactResponse> {
        self.manager(request.kind).execute(request).await
    }

    pub async fn reload(&self) -> Result<()> {
        for manager in self.managers() {
            manager.reload().await?;
        }
        Ok(())
    }

    /// Exports every domain into `dir`, in kind order.
    pub async fn export_snapshot(&self, dir: &Path) -> Result<Vec<DomainSnapshot>> {
        let mut domains = Vec::with_capacity(ArtifactKind::ALL.len());
        for manager in self.managers() {
            domains.push(manager.export_snapshot(dir).await?);
        }
        Ok(domains)
    }

    pub async fn import_snapshot(&self, dir: &Path, domains: &[DomainSnapshot]) -> Result<()> {
        for kind in ArtifactKind::ALL {
            let domain = domains
                .iter()
                .find(|domain| domain.kind == kind)
                .ok_or_else(|| DepotError::Corrupted(format!("snapshot lacks the {} domain", kind)))?;
            self.manager(kind).import_snapshot(dir, domain).await?;
        }
        Ok(())
    }

    pub fn blob_root(data_dir: &Path) -> PathBuf {
        data_dir.join(BLOB_DIR_NAME)
    }
}
