//! Bounded LRU cache of read descriptors.
//!
//! Each cached handle reads from a private hard link of the blob, so removing
//! or replacing the blob never disturbs readers that already hold the handle.
//! The link is unlinked when the last `Arc<ReadHandle>` is dropped.

use crate::artifact::Version;
use crate::error::{DepotError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_READ_CACHE_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct ReadHandle {
    file: File,
    link_path: PathBuf,
    len: u64,
}

impl ReadHandle {
    fn open(blob_path: &Path, readers_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(readers_dir)?;

        let file_name = blob_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("blob");
        let link_path = readers_dir.join(format!("{}.{}", file_name, ulid::Ulid::new()));

        if std::fs::hard_link(blob_path, &link_path).is_err() {
            std::fs::copy(blob_path, &link_path)?;
        }

        let file = match File::open(&link_path) {
            Ok(file) => file,
            Err(err) => {
                let _ = std::fs::remove_file(&link_path);
                return Err(err.into());
            }
        };
        let len = file.metadata()?.len();

        Ok(Self {
            file,
            link_path,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads up to `count` bytes starting at `offset`; short only at end of file.
    pub fn read_at(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        let available = self.len.saturating_sub(offset) as usize;
        let mut buf = vec![0_u8; count.min(available)];
        let mut filled = 0;

        while filled < buf.len() {
            let read = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        buf.truncate(filled);
        Ok(buf)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.link_path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                path = %self.link_path.display(),
                error = %err,
                "failed to remove reader link"
            );
        }
    }
}

struct CacheEntry {
    handle: Arc<ReadHandle>,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<(String, Version), CacheEntry>,
    tick: u64,
}

pub struct ReadCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn get_or_open(
        &self,
        name: &str,
        version: Version,
        blob_path: &Path,
        readers_dir: &Path,
    ) -> Result<Arc<ReadHandle>> {
        let key = (name.to_string(), version);
        if let Some(handle) = self.touch(&key).await {
            return Ok(handle);
        }

        // linking and opening run off the runtime with the cache unlocked
        let handle = {
            let blob_path = blob_path.to_path_buf();
            let readers_dir = readers_dir.to_path_buf();
            tokio::task::spawn_blocking(move || ReadHandle::open(&blob_path, &readers_dir))
                .await
                .map_err(|err| DepotError::Internal(format!("open task failed: {}", err)))??
        };
        let handle = Arc::new(handle);

        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.entries.get_mut(&key) {
            // another caller opened it meanwhile; ours unlinks on drop
            entry.last_used = tick;
            return Ok(Arc::clone(&entry.handle));
        }

        if inner.entries.len() >= self.capacity {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_key, entry)| entry.last_used)
                .map(|(key, _entry)| key.clone());
            if let Some(victim) = victim {
                inner.entries.remove(&victim);
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                handle: Arc::clone(&handle),
                last_used: tick,
            },
        );
        Ok(handle)
    }

    async fn touch(&self, key: &(String, Version)) -> Option<Arc<ReadHandle>> {
        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            Arc::clone(&entry.handle)
        })
    }

    pub async fn invalidate(&self, name: &str, version: Version) {
        self.inner
            .lock()
            .await
            .entries
            .remove(&(name.to_string(), version));
    }

    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new(DEFAULT_READ_CACHE_CAPACITY)
    }
}

/// Removes reader links left behind by a previous process.
pub fn purge_stale_links(readers_dir: &Path) -> Result<usize> {
    if !readers_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(readers_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(files: &[(&str, &[u8])]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        for (name, data) in files {
            std::fs::write(dir.path().join(name), data).unwrap();
        }
        let readers = dir.path().join(".readers");
        (dir, readers)
    }

    fn link_count(readers: &Path) -> usize {
        std::fs::read_dir(readers).map(|dir| dir.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn cached_handle_is_reused_and_reads_ranges() {
        let (dir, readers) = setup(&[("vocab.1.0.0", b"aaabbbccc")]);
        let cache = ReadCache::new(4);
        let version = Version::new(1, 0, 0);
        let blob = dir.path().join("vocab.1.0.0");

        let first = cache.get_or_open("vocab", version, &blob, &readers).await.unwrap();
        let second = cache.get_or_open("vocab", version, &blob, &readers).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(link_count(&readers), 1);

        assert_eq!(first.read_at(3, 3).unwrap(), b"bbb");
        assert_eq!(first.read_at(6, 100).unwrap(), b"ccc");
        assert!(first.read_at(9, 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used() {
        let (dir, readers) = setup(&[("a.1.0.0", b"a"), ("b.1.0.0", b"b"), ("c.1.0.0", b"c")]);
        let cache = ReadCache::new(2);
        let version = Version::new(1, 0, 0);

        for name in ["a", "b"] {
            let blob = dir.path().join(format!("{name}.1.0.0"));
            cache.get_or_open(name, version, &blob, &readers).await.unwrap();
        }
        // touch "a" so that "b" becomes the eviction victim
        cache
            .get_or_open("a", version, &dir.path().join("a.1.0.0"), &readers)
            .await
            .unwrap();
        cache
            .get_or_open("c", version, &dir.path().join("c.1.0.0"), &readers)
            .await
            .unwrap();

        assert_eq!(cache.len().await, 2);
        assert_eq!(link_count(&readers), 2);

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(link_count(&readers), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_opens_share_one_entry() {
        let (dir, readers) = setup(&[("vocab.1.0.0", b"aaabbbccc")]);
        let cache = ReadCache::new(4);
        let version = Version::new(1, 0, 0);
        let blob = dir.path().join("vocab.1.0.0");

        let (first, second) = tokio::join!(
            cache.get_or_open("vocab", version, &blob, &readers),
            cache.get_or_open("vocab", version, &blob, &readers),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len().await, 1);
        assert_eq!(link_count(&readers), 1);
        assert_eq!(second.read_at(0, 3).unwrap(), b"aaa");
    }

    #[tokio::test]
    async fn handle_outlives_removed_blob() {
        let (dir, readers) = setup(&[("p.so.2.0.0", b"plugin-bytes")]);
        let cache = ReadCache::new(1);
        let version = Version::new(2, 0, 0);
        let blob = dir.path().join("p.so.2.0.0");

        let handle = cache.get_or_open("p", version, &blob, &readers).await.unwrap();
        std::fs::remove_file(&blob).unwrap();
        cache.invalidate("p", version).await;

        assert_eq!(handle.read_at(0, 6).unwrap(), b"plugin");
        drop(handle);
        assert_eq!(link_count(&readers), 0);
    }
}
