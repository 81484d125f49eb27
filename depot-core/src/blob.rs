use crate::error::Result;
use md5::{Digest, Md5};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const HASH_BUFFER_SIZE: usize = 64 * 1024;
pub const READERS_DIR: &str = ".readers";

/// BlobStore keeps the payload files of one artifact kind flat under
/// `{base_path}/{name}.{ext}.{major}.{minor}.{patch}`.
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn blob_path(&self, file_name: &str) -> PathBuf {
        self.base_path.join(file_name)
    }

    /// Directory holding the hard links behind cached read descriptors.
    pub fn readers_dir(&self) -> PathBuf {
        self.base_path.join(READERS_DIR)
    }

    pub fn exists(&self, file_name: &str) -> bool {
        self.blob_path(file_name).exists()
    }

    /// Creates (or truncates) the blob and sizes it to `size` bytes.
    pub async fn allocate(&self, file_name: &str, size: u64) -> Result<()> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.blob_path(file_name))
            .await?;
        file.set_len(size).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn open_writer(&self, file_name: &str, size: u64) -> Result<BlobWriter> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.blob_path(file_name))
            .await?;
        Ok(BlobWriter { file, size })
    }

    pub async fn read_all(&self, file_name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.blob_path(file_name)).await?)
    }

    pub async fn md5(&self, file_name: &str) -> Result<String> {
        md5_file(&self.blob_path(file_name)).await
    }

    /// Returns whether a file was actually removed.
    pub async fn remove(&self, file_name: &str) -> Result<bool> {
        match fs::remove_file(self.blob_path(file_name)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Hard-links the blob to `dest`, copying when linking is not possible.
    pub async fn link_to(&self, file_name: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let source = self.blob_path(file_name);
        if fs::hard_link(&source, dest).await.is_err() {
            fs::copy(&source, dest).await?;
        }
        Ok(())
    }

    /// Copies `source` into the store unless the local blob already holds
    /// the same bytes: same size, and an md5 equal to `expected_md5` (or to
    /// the source's md5 when no digest is known). Returns whether bytes were
    /// copied.
    pub async fn import_from(
        &self,
        source: &Path,
        file_name: &str,
        expected_md5: Option<&str>,
    ) -> Result<bool> {
        let target = self.blob_path(file_name);
        let source_len = fs::metadata(source).await?.len();

        if let Ok(existing) = fs::metadata(&target).await
            && existing.len() == source_len
        {
            let expected = match expected_md5 {
                Some(digest) => digest.to_string(),
                None => md5_file(source).await?,
            };
            if md5_file(&target).await? == expected {
                return Ok(false);
            }
        }

        let tmp_path = target.with_extension(format!("{}.tmp", ulid::Ulid::new()));
        fs::copy(source, &tmp_path).await?;
        fs::rename(&tmp_path, &target).await?;
        Ok(true)
    }

    /// Lists blob file names, skipping the readers directory and temp files.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && !name.ends_with(".tmp")
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Write handle over one blob. Every chunk is written positionally, then the
/// file is truncated back to its declared size and synced.
pub struct BlobWriter {
    file: fs::File,
    size: u64,
}

impl BlobWriter {
    pub async fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.file.set_len(self.size).await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

pub async fn md5_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0_u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn out_of_order_chunks_fill_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("dict")).unwrap();
        store.allocate("vocab.1.0.0", 9).await.unwrap();

        let mut writer = store.open_writer("vocab.1.0.0", 9).await.unwrap();
        writer.write_chunk(6, b"ccc").await.unwrap();
        writer.write_chunk(0, b"aaa").await.unwrap();
        writer.write_chunk(3, b"bbb").await.unwrap();
        drop(writer);

        assert_eq!(store.read_all("vocab.1.0.0").await.unwrap(), b"aaabbbccc");
        assert_eq!(
            store.md5("vocab.1.0.0").await.unwrap(),
            md5_hex(b"aaabbbccc")
        );
    }

    #[tokio::test]
    async fn import_skips_only_identical_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("plugin")).unwrap();
        let source = dir.path().join("incoming");
        std::fs::write(&source, b"abc").unwrap();

        assert!(store.import_from(&source, "p.so.1.0.0", None).await.unwrap());
        assert!(!store.import_from(&source, "p.so.1.0.0", None).await.unwrap());
        let digest = md5_hex(b"abc");
        assert!(!store.import_from(&source, "p.so.1.0.0", Some(&digest)).await.unwrap());

        std::fs::write(&source, b"xyz").unwrap();
        assert!(store.import_from(&source, "p.so.1.0.0", None).await.unwrap());
        assert_eq!(store.read_all("p.so.1.0.0").await.unwrap(), b"xyz");

        std::fs::write(&source, b"abcdef").unwrap();
        assert!(store.import_from(&source, "p.so.1.0.0", None).await.unwrap());
        assert_eq!(store.read_all("p.so.1.0.0").await.unwrap(), b"abcdef");
        assert_eq!(store.list().await.unwrap(), vec!["p.so.1.0.0".to_string()]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf()).unwrap();
        store.allocate("x.1.0.0", 0).await.unwrap();
        assert!(store.remove("x.1.0.0").await.unwrap());
        assert!(!store.remove("x.1.0.0").await.unwrap());
    }

    #[test]
    fn md5_of_known_input() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
