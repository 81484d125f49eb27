use depot_core::DepotError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaftNodeError>;

#[derive(Debug, Error)]
pub enum RaftNodeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("depot error: {0}")]
    Depot(#[from] DepotError),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for RaftNodeError {
    fn from(error: reqwest::Error) -> Self {
        RaftNodeError::Http(error.to_string())
    }
}
