//! Chunked upload/download over any [`ArtifactEndpoint`].
//!
//! Upload is `CREATE` followed by `UPLOAD` chunks until the server reports the
//! artifact finished; an interrupted upload resumes from the end of the
//! gap-free prefix reported by `INFO`. Download streams `DOWNLOAD` chunks into a temp file,
//! re-verifies the md5 and only then renames it into place.

use crate::artifact::{Artifact, ArtifactKind, Version};
use crate::blob::{md5_file, md5_hex};
use crate::error::{DepotError, Result};
use crate::request::{ArtifactRequest, ArtifactResponse, OpType};
use async_trait::async_trait;
use md5::{Digest, Md5};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Transport seam between the transfer client and a depot replica.
#[async_trait]
pub trait ArtifactEndpoint: Send + Sync {
    /// Sends one request and returns the replica's response, failed or not.
    async fn call(&self, request: ArtifactRequest) -> Result<ArtifactResponse>;
}

#[async_trait]
impl<E: ArtifactEndpoint + ?Sized> ArtifactEndpoint for std::sync::Arc<E> {
    async fn call(&self, request: ArtifactRequest) -> Result<ArtifactResponse> {
        (**self).call(request).await
    }
}

enum ChunkSource<'a> {
    Memory(&'a [u8]),
    File(fs::File),
}

impl ChunkSource<'_> {
    async fn read_chunk(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            ChunkSource::Memory(data) => {
                let start = offset as usize;
                Ok(data[start..start + len].to_vec())
            }
            ChunkSource::File(file) => {
                let mut buf = vec![0_u8; len];
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

pub struct TransferClient<E> {
    endpoint: E,
    chunk_size: usize,
}

impl<E: ArtifactEndpoint> TransferClient<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Sends a request and turns a failed response into an error.
    pub async fn send(&self, request: ArtifactRequest) -> Result<ArtifactResponse> {
        self.endpoint.call(request).await?.into_result()
    }

    pub async fn info(
        &self,
        kind: ArtifactKind,
        name: &str,
        version: Option<Version>,
    ) -> Result<Artifact> {
        let mut request = ArtifactRequest::new(OpType::Info, kind, name);
        request.version = version;
        self.send(request)
            .await?
            .artifact
            .ok_or_else(|| DepotError::Http(format!("INFO of {}/{} returned no artifact", kind, name)))
    }

    /// Uploads an in-memory payload. Config payloads must be UTF-8 text.
    pub async fn upload_bytes(
        &self,
        kind: ArtifactKind,
        name: &str,
        version: Version,
        ext: &str,
        data: &[u8],
    ) -> Result<Artifact> {
        let checksum = md5_hex(data);
        let content = if kind.has_blob() {
            None
        } else {
            Some(String::from_utf8(data.to_vec()).map_err(|_| {
                DepotError::InvalidArgument("config content must be UTF-8".to_string())
            })?)
        };

        let mut create = ArtifactRequest::create(kind, name, version, data.len() as i64, checksum);
        create.ext = ext.to_string();
        create.content = content;

        self.upload(create, ChunkSource::Memory(data)).await
    }

    pub async fn upload_file(
        &self,
        kind: ArtifactKind,
        name: &str,
        version: Version,
        ext: &str,
        path: &Path,
    ) -> Result<Artifact> {
        if !kind.has_blob() {
            let data = fs::read(path).await?;
            return self.upload_bytes(kind, name, version, ext, &data).await;
        }

        let size = fs::metadata(path).await?.len();
        let checksum = md5_file(path).await?;
        let mut create = ArtifactRequest::create(kind, name, version, size as i64, checksum);
        create.ext = ext.to_string();

        let file = fs::File::open(path).await?;
        self.upload(create, ChunkSource::File(file)).await
    }

    async fn upload(&self, create: ArtifactRequest, mut source: ChunkSource<'_>) -> Result<Artifact> {
        let kind = create.kind;
        let name = create.name.clone();
        let version = create.version.ok_or_else(|| {
            DepotError::InvalidArgument("version is required for upload".to_string())
        })?;

        let mut artifact = match self.endpoint.call(info_request(kind, &name, version)).await? {
            response if response.is_success() => {
                let existing = response.artifact.ok_or_else(|| {
                    DepotError::Http(format!("INFO of {} returned no artifact", create.id()))
                })?;
                if existing.size != create.size || existing.checksum != create.checksum {
                    return Err(DepotError::AlreadyExists(format!(
                        "{} exists with different size or checksum",
                        existing.id()
                    )));
                }
                tracing::info!(
                    artifact = %existing.id(),
                    upload_size = existing.upload_size,
                    "resuming upload"
                );
                existing
            }
            _ => self.send(create.clone()).await?.artifact.ok_or_else(|| {
                DepotError::Http(format!("CREATE of {} returned no artifact", create.id()))
            })?,
        };

        let mut offset = artifact.resume_offset().max(0) as u64;
        let size = artifact.size as u64;
        while !artifact.finish && offset < size {
            let len = self.chunk_size.min((size - offset) as usize);
            let data = source.read_chunk(offset, len).await?;
            let request = ArtifactRequest::upload(kind, &name, version, offset as i64, data);

            artifact = self.send(request).await?.artifact.ok_or_else(|| {
                DepotError::Http(format!("UPLOAD of {} returned no artifact", create.id()))
            })?;
            offset += len as u64;
        }

        if !artifact.finish {
            return Err(DepotError::NotFinished(artifact.id()));
        }
        Ok(artifact)
    }

    /// Downloads a finished artifact into memory and verifies it.
    pub async fn download_bytes(
        &self,
        kind: ArtifactKind,
        name: &str,
        version: Option<Version>,
    ) -> Result<(Artifact, Vec<u8>)> {
        let artifact = self.finished_info(kind, name, version).await?;
        let mut data = Vec::with_capacity(artifact.size.max(0) as usize);

        while (data.len() as i64) < artifact.size {
            let chunk = self.download_chunk(&artifact, data.len() as i64).await?;
            data.extend_from_slice(&chunk);
        }

        let actual = md5_hex(&data);
        if actual != artifact.checksum {
            return Err(DepotError::ChecksumMismatch {
                expected: artifact.checksum,
                actual,
            });
        }
        Ok((artifact, data))
    }

    /// Downloads a finished artifact to `dest` through a temp file that is
    /// discarded on any failure.
    pub async fn download_to(
        &self,
        kind: ArtifactKind,
        name: &str,
        version: Option<Version>,
        dest: &Path,
    ) -> Result<Artifact> {
        let artifact = self.finished_info(kind, name, version).await?;
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = dest.with_extension(format!("{}.tmp", ulid::Ulid::new()));
        let result = self.download_into(&artifact, &tmp_path).await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        fs::rename(&tmp_path, dest).await?;
        Ok(artifact)
    }

    async fn download_into(&self, artifact: &Artifact, tmp_path: &Path) -> Result<()> {
        let mut file = fs::File::create(tmp_path).await?;
        let mut hasher = Md5::new();
        let mut offset = 0_i64;

        while offset < artifact.size {
            let chunk = self.download_chunk(artifact, offset).await?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            offset += chunk.len() as i64;
        }
        file.sync_all().await?;

        let actual = hex::encode(hasher.finalize());
        if actual != artifact.checksum {
            return Err(DepotError::ChecksumMismatch {
                expected: artifact.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    async fn download_chunk(&self, artifact: &Artifact, offset: i64) -> Result<Vec<u8>> {
        let request = ArtifactRequest::download(
            artifact.kind,
            &artifact.name,
            artifact.version,
            offset,
            self.chunk_size as i64,
        );
        let data = self.send(request).await?.data;
        if data.is_empty() {
            return Err(DepotError::Http(format!(
                "empty chunk at offset {} of {}",
                offset,
                artifact.id()
            )));
        }
        Ok(data)
    }

    async fn finished_info(
        &self,
        kind: ArtifactKind,
        name: &str,
        version: Option<Version>,
    ) -> Result<Artifact> {
        let artifact = self.info(kind, name, version).await?;
        if !artifact.finish {
            return Err(DepotError::NotFinished(artifact.id()));
        }
        Ok(artifact)
    }
}

fn info_request(kind: ArtifactKind, name: &str, version: Version) -> ArtifactRequest {
    ArtifactRequest::new(OpType::Info, kind, name).with_version(version)
}
