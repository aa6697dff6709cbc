use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for nexus_core::error::ProxyError {
    fn from(e: StorageError) -> Self {
        nexus_core::error::ProxyError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
