//! Depot Core - versioned artifact storage shared by every depot replica
//!
//! A namespaced key-value store with range-file snapshots, the per-kind
//! artifact managers built on top of it, and the chunked transfer protocol
//! clients use to move artifact payloads.

pub mod artifact;
pub mod blob;
pub mod catalog;
pub mod command;
pub mod error;
pub mod index;
pub mod manager;
pub mod read_cache;
pub mod request;
pub mod store;
pub mod transfer;

pub use artifact::{
    Artifact, ArtifactKind, Version, blob_file_name, name_prefix, normalize_checksum, record_key,
    validate_ext, validate_name,
};
pub use blob::{BlobStore, BlobWriter, md5_file, md5_hex};
pub use catalog::Catalog;
pub use command::ReplicatedCommand;
pub use error::{DepotError, Result};
pub use index::ArtifactIndex;
pub use manager::{ArtifactManager, DomainSnapshot, now_timestamp};
pub use read_cache::{DEFAULT_READ_CACHE_CAPACITY, ReadCache, ReadHandle};
pub use request::{ArtifactRequest, ArtifactResponse, ErrorCode, OpType};
pub use store::{NamespaceStore, RangeEntry, Store, decode_entries, encode_entries};
pub use transfer::{ArtifactEndpoint, DEFAULT_CHUNK_SIZE, TransferClient};
