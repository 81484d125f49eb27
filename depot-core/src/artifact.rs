//! Artifact model shared by every domain.
//!
//! An artifact is identified by `(kind, name, version)`. Config artifacts keep
//! their content inline in the record; dict and plugin artifacts reference a
//! blob file named `{name}.{ext}.{major}.{minor}.{patch}`.

use crate::error::{DepotError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const NAME_MAX_LEN: usize = 255;
const CHECKSUM_HEX_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Config,
    Dict,
    Plugin,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Config, ArtifactKind::Dict, ArtifactKind::Plugin];

    /// Single-byte store namespace, also used as the kind half of command tags.
    pub fn namespace(self) -> u8 {
        match self {
            ArtifactKind::Config => 0x01,
            ArtifactKind::Dict => 0x02,
            ArtifactKind::Plugin => 0x03,
        }
    }

    pub fn from_namespace(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ArtifactKind::Config),
            0x02 => Some(ArtifactKind::Dict),
            0x03 => Some(ArtifactKind::Plugin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Config => "config",
            ArtifactKind::Dict => "dict",
            ArtifactKind::Plugin => "plugin",
        }
    }

    pub fn has_blob(self) -> bool {
        !matches!(self, ArtifactKind::Config)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = DepotError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "config" => Ok(ArtifactKind::Config),
            "dict" => Ok(ArtifactKind::Dict),
            "plugin" => Ok(ArtifactKind::Plugin),
            other => Err(DepotError::InvalidArgument(format!(
                "unknown artifact kind '{}': expected config, dict or plugin",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn to_be_bytes(self) -> [u8; 12] {
        let mut bytes = [0_u8; 12];
        bytes[0..4].copy_from_slice(&self.major.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.minor.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.patch.to_be_bytes());
        bytes
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = DepotError;

    fn from_str(value: &str) -> Result<Self> {
        let mut parts = value.trim().split('.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|part| part.parse::<u32>().ok())
                .ok_or_else(|| DepotError::InvalidVersion(value.to_string()))
        };

        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(DepotError::InvalidVersion(value.to_string()));
        }

        Ok(version)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub size: i64,
    pub checksum: String,
    pub created_at: i64,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub upload_size: i64,
    #[serde(default)]
    pub finish: bool,
    #[serde(default)]
    pub tombstone: bool,
    /// Merged, sorted `[start, end)` byte ranges written so far. Cleared once
    /// the upload finishes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub received: Vec<(i64, i64)>,
}

impl Artifact {
    pub fn key(&self) -> Vec<u8> {
        record_key(&self.name, self.version)
    }

    pub fn blob_file_name(&self) -> String {
        blob_file_name(&self.name, &self.ext, self.version)
    }

    pub fn id(&self) -> String {
        format!("{}/{}@{}", self.kind, self.name, self.version)
    }

    /// Records `[start, end)` as written, merging touching ranges.
    pub fn mark_received(&mut self, start: i64, end: i64) {
        if start >= end {
            return;
        }

        let mut merged = Vec::with_capacity(self.received.len() + 1);
        let (mut lo, mut hi) = (start, end);
        for &(s, e) in &self.received {
            if e < lo || s > hi {
                merged.push((s, e));
            } else {
                lo = lo.min(s);
                hi = hi.max(e);
            }
        }
        merged.push((lo, hi));
        merged.sort_unstable();
        self.received = merged;
    }

    /// Whether every byte of `[0, size)` has been written.
    pub fn fully_received(&self) -> bool {
        self.size == 0 || self.received.first() == Some(&(0, self.size))
    }

    /// End of the gap-free prefix; an interrupted upload continues here.
    pub fn resume_offset(&self) -> i64 {
        if self.finish {
            return self.size;
        }
        match self.received.first() {
            Some(&(0, end)) => end,
            _ => 0,
        }
    }
}

/// Store key of one artifact record: `name ‖ 0x00 ‖ version (big endian)`.
pub fn record_key(name: &str, version: Version) -> Vec<u8> {
    let mut key = name_prefix(name);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Prefix shared by every version of `name`.
pub fn name_prefix(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 13);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

pub fn blob_file_name(name: &str, ext: &str, version: Version) -> String {
    if ext.is_empty() {
        format!("{}.{}", name, version)
    } else {
        format!("{}.{}.{}", name, ext, version)
    }
}

/// Other `(name, ext)` pairs whose blob file name equals that of
/// `(name, ext)` at any version, e.g. `("a.txt", "")` for `("a", "txt")`.
pub fn blob_name_aliases(name: &str, ext: &str) -> Vec<(String, String)> {
    let joined = if ext.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", name, ext)
    };

    let mut aliases = vec![(joined.clone(), String::new())];
    for (at, _) in joined.match_indices('.') {
        aliases.push((joined[..at].to_string(), joined[at + 1..].to_string()));
    }
    aliases.retain(|(n, e)| !n.is_empty() && (n != name || e != ext));
    aliases
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DepotError::InvalidArgument(
            "artifact name cannot be empty".to_string(),
        ));
    }

    if name.len() > NAME_MAX_LEN {
        return Err(DepotError::InvalidArgument(format!(
            "artifact name exceeds {} bytes",
            NAME_MAX_LEN
        )));
    }

    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(DepotError::InvalidArgument(format!(
            "invalid artifact name: {}",
            name
        )));
    }

    Ok(())
}

pub fn validate_ext(ext: &str) -> Result<()> {
    if ext.contains(['/', '\\', '\0']) || ext == "." || ext == ".." {
        return Err(DepotError::InvalidArgument(format!(
            "invalid artifact extension: {}",
            ext
        )));
    }
    Ok(())
}

/// Normalizes a client-supplied md5 hex digest to lowercase.
pub fn normalize_checksum(checksum: &str) -> Result<String> {
    let trimmed = checksum.trim();
    if trimmed.len() != CHECKSUM_HEX_LEN || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DepotError::InvalidArgument(format!(
            "checksum '{}' is not a {}-char hex md5 digest",
            checksum, CHECKSUM_HEX_LEN
        )));
    }
    Ok(trimmed.to_ascii_lowercase())
}
