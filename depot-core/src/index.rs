use crate::artifact::{Artifact, Version};
use std::collections::BTreeMap;

/// In-memory `name -> version -> artifact` index. Derived from the store and
/// rebuilt from it on restart or snapshot install.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArtifactIndex {
    entries: BTreeMap<String, BTreeMap<Version, Artifact>>,
}

impl ArtifactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, artifact: Artifact) -> Option<Artifact> {
        self.entries
            .entry(artifact.name.clone())
            .or_default()
            .insert(artifact.version, artifact)
    }

    pub fn remove(&mut self, name: &str, version: Version) -> Option<Artifact> {
        let versions = self.entries.get_mut(name)?;
        let removed = versions.remove(&version);
        if versions.is_empty() {
            self.entries.remove(name);
        }
        removed
    }

    pub fn remove_all(&mut self, name: &str) -> Vec<Artifact> {
        self.entries
            .remove(name)
            .map(|versions| versions.into_values().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str, version: Version) -> Option<&Artifact> {
        self.entries.get(name)?.get(&version)
    }

    pub fn get_mut(&mut self, name: &str, version: Version) -> Option<&mut Artifact> {
        self.entries.get_mut(name)?.get_mut(&version)
    }

    pub fn contains(&self, name: &str, version: Version) -> bool {
        self.get(name, version).is_some()
    }

    /// Highest version present for `name`.
    pub fn latest(&self, name: &str) -> Option<&Artifact> {
        self.entries
            .get(name)?
            .iter()
            .next_back()
            .map(|(_version, artifact)| artifact)
    }

    /// Version omitted means the highest version present.
    pub fn lookup(&self, name: &str, version: Option<Version>) -> Option<&Artifact> {
        match version {
            Some(version) => self.get(name, version),
            None => self.latest(name),
        }
    }

    pub fn max_version(&self, name: &str) -> Option<Version> {
        self.entries.get(name)?.keys().next_back().copied()
    }

    pub fn versions(&self, name: &str) -> Vec<Version> {
        self.entries
            .get(name)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn artifacts_of(&self, name: &str) -> Vec<Artifact> {
        self.entries
            .get(name)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All versions of `names`, or of every name when `names` is empty.
    pub fn list(&self, names: &[String]) -> Vec<Artifact> {
        if names.is_empty() {
            return self.iter().cloned().collect();
        }

        let mut wanted: Vec<&String> = names.iter().collect();
        wanted.sort();
        wanted.dedup();

        wanted
            .into_iter()
            .flat_map(|name| self.artifacts_of(name))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.entries.values().flat_map(|versions| versions.values())
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;

    fn artifact(name: &str, version: Version) -> Artifact {
        Artifact {
            kind: ArtifactKind::Dict,
            name: name.to_string(),
            version,
            content: None,
            size: 0,
            checksum: String::new(),
            created_at: 0,
            ext: String::new(),
            upload_size: 0,
            finish: false,
            tombstone: false,
            received: Vec::new(),
        }
    }

    #[test]
    fn latest_is_highest_version_not_last_inserted() {
        let mut index = ArtifactIndex::new();
        index.insert(artifact("vocab", Version::new(2, 0, 0)));
        index.insert(artifact("vocab", Version::new(1, 5, 0)));

        let latest = index.latest("vocab").unwrap();
        assert_eq!(latest.version, Version::new(2, 0, 0));
        assert_eq!(index.max_version("vocab"), Some(Version::new(2, 0, 0)));
        assert_eq!(
            index.versions("vocab"),
            vec![Version::new(1, 5, 0), Version::new(2, 0, 0)]
        );
    }

    #[test]
    fn removing_last_version_drops_name() {
        let mut index = ArtifactIndex::new();
        index.insert(artifact("vocab", Version::new(1, 0, 0)));
        assert!(index.remove("vocab", Version::new(1, 0, 0)).is_some());
        assert!(index.is_empty());
        assert_eq!(index.names().count(), 0);
    }

    #[test]
    fn list_filters_by_names() {
        let mut index = ArtifactIndex::new();
        index.insert(artifact("a", Version::new(1, 0, 0)));
        index.insert(artifact("b", Version::new(1, 0, 0)));
        index.insert(artifact("b", Version::new(1, 1, 0)));

        assert_eq!(index.list(&[]).len(), 3);
        let only_b = index.list(&["b".to_string(), "missing".to_string()]);
        assert_eq!(only_b.len(), 2);
        assert!(only_b.iter().all(|item| item.name == "b"));
        assert_eq!(index.len(), 3);
    }
}
