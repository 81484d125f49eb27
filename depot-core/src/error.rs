use crate::request::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DepotError>;

#[derive(Error, Debug)]
pub enum DepotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid version '{0}': expected major.minor.patch")]
    InvalidVersion(String),

    #[error("Artifact already exists: {0}")]
    AlreadyExists(String),

    #[error("Artifact already tombstoned: {0}")]
    AlreadyTombstoned(String),

    #[error("Version {requested} of {name} must be greater than {current}")]
    VersionNotIncreasing {
        name: String,
        requested: String,
        current: String,
    },

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact upload not finished: {0}")]
    NotFinished(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Not leader, leader hint: {leader_hint:?}")]
    NotLeader { leader_hint: Option<String> },

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DepotError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DepotError::InvalidArgument(_)
            | DepotError::InvalidVersion(_)
            | DepotError::AlreadyExists(_)
            | DepotError::AlreadyTombstoned(_)
            | DepotError::VersionNotIncreasing { .. }
            | DepotError::NotFound(_)
            | DepotError::NotFinished(_)
            | DepotError::ChecksumMismatch { .. } => ErrorCode::InputParamError,
            DepotError::Serialization(_) => ErrorCode::ParseFromPbFail,
            DepotError::NotLeader { .. } => ErrorCode::NotLeader,
            DepotError::Unsupported(_) => ErrorCode::UnsupportedRequest,
            DepotError::Io(_)
            | DepotError::Store(_)
            | DepotError::Corrupted(_)
            | DepotError::Config(_)
            | DepotError::Raft(_)
            | DepotError::Http(_)
            | DepotError::Internal(_) => ErrorCode::InternalError,
        }
    }
}
