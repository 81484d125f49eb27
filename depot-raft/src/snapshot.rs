//! Snapshot images.
//!
//! A snapshot directory holds one range file and one blob directory per
//! domain plus `manifest.json`. For transfer through openraft the directory is
//! packed into a single bundle using the range-file encoding, keyed by the
//! relative path of each file.

use crate::types::DepotNodeId;
use depot_core::{DepotError, DomainSnapshot, Result, decode_entries, encode_entries};
use openraft::BasicNode;
use openraft::LogId;
use openraft::StoredMembership;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub last_applied_log: Option<LogId<DepotNodeId>>,
    pub last_membership: StoredMembership<DepotNodeId, BasicNode>,
    pub domains: Vec<DomainSnapshot>,
}

/// Collects the files of a snapshot directory and packs them.
pub struct SnapshotWriter {
    dir: PathBuf,
    files: BTreeSet<String>,
}

impl SnapshotWriter {
    /// Starts from an empty `dir`, removing leftovers of an earlier attempt.
    pub fn create(dir: PathBuf) -> Result<Self> {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            files: BTreeSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn add_file(&mut self, relative: &str) -> Result<()> {
        let path = self.dir.join(checked_relative(relative)?);
        if !path.is_file() {
            return Err(DepotError::Internal(format!(
                "snapshot file {} does not exist",
                path.display()
            )));
        }
        self.files.insert(relative.to_string());
        Ok(())
    }

    pub fn add_domain(&mut self, domain: &DomainSnapshot) -> Result<()> {
        self.add_file(&domain.range_file)?;
        for blob in &domain.blobs {
            self.add_file(blob)?;
        }
        Ok(())
    }

    /// Writes the manifest and packs every registered file into one bundle.
    pub fn finish(mut self, manifest: &SnapshotManifest) -> Result<Vec<u8>> {
        let encoded = serde_json::to_vec_pretty(manifest)?;
        std::fs::write(self.dir.join(MANIFEST_FILE), encoded)?;
        self.files.insert(MANIFEST_FILE.to_string());

        let mut entries = Vec::with_capacity(self.files.len());
        for relative in &self.files {
            let data = std::fs::read(self.dir.join(relative))?;
            entries.push((relative.as_bytes().to_vec(), data));
        }

        Ok(encode_entries(entries)?.to_vec())
    }
}

/// An unpacked snapshot directory and its manifest.
pub struct SnapshotReader {
    dir: PathBuf,
    manifest: SnapshotManifest,
}

impl SnapshotReader {
    pub fn unpack(bundle: &[u8], dir: PathBuf) -> Result<Self> {
        let entries = decode_entries(bundle)?;

        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        for (key, value) in entries {
            let relative = String::from_utf8(key)
                .map_err(|_| DepotError::Corrupted("snapshot path is not UTF-8".to_string()))?;
            let path = dir.join(checked_relative(&relative)?);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, value)?;
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(DepotError::Corrupted(
                "snapshot bundle has no manifest".to_string(),
            ));
        }
        let manifest: SnapshotManifest = serde_json::from_slice(&std::fs::read(manifest_path)?)?;

        for domain in &manifest.domains {
            let listed = std::iter::once(&domain.range_file).chain(domain.blobs.iter());
            for relative in listed {
                if !dir.join(checked_relative(relative)?).is_file() {
                    return Err(DepotError::Corrupted(format!(
                        "snapshot {} lists missing file {}",
                        manifest.snapshot_id, relative
                    )));
                }
            }
        }

        Ok(Self { dir, manifest })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }
}

fn checked_relative(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    let safe = !path.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !safe {
        return Err(DepotError::Corrupted(format!(
            "snapshot path escapes its directory: {}",
            path
        )));
    }
    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::ArtifactKind;

    fn manifest(domains: Vec<DomainSnapshot>) -> SnapshotManifest {
        SnapshotManifest {
            snapshot_id: "1-5-1".to_string(),
            last_applied_log: None,
            last_membership: StoredMembership::default(),
            domains,
        }
    }

    #[test]
    fn pack_and_unpack_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::create(dir.path().join("build")).unwrap();
        std::fs::write(writer.dir().join("dict.range"), b"range").unwrap();
        std::fs::create_dir_all(writer.dir().join("dict")).unwrap();
        std::fs::write(writer.dir().join("dict/vocab.1.0.0"), b"aaabbbccc").unwrap();

        let domain = DomainSnapshot {
            kind: ArtifactKind::Dict,
            range_file: "dict.range".to_string(),
            blobs: vec!["dict/vocab.1.0.0".to_string()],
        };
        writer.add_domain(&domain).unwrap();
        let bundle = writer.finish(&manifest(vec![domain.clone()])).unwrap();

        let reader = SnapshotReader::unpack(&bundle, dir.path().join("install")).unwrap();
        assert_eq!(reader.manifest().domains, vec![domain]);
        assert_eq!(
            std::fs::read(reader.dir().join("dict/vocab.1.0.0")).unwrap(),
            b"aaabbbccc"
        );
    }

    #[test]
    fn unregistered_missing_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::create(dir.path().join("build")).unwrap();
        assert!(writer.add_file("config.range").is_err());
        assert!(writer.add_file("../escape").is_err());

        // a manifest pointing at files the bundle does not carry
        let domain = DomainSnapshot {
            kind: ArtifactKind::Plugin,
            range_file: "plugin.range".to_string(),
            blobs: Vec::new(),
        };
        let bundle = writer.finish(&manifest(vec![domain])).unwrap();
        assert!(matches!(
            SnapshotReader::unpack(&bundle, dir.path().join("install")),
            Err(DepotError::Corrupted(_))
        ));
    }
}
