use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Authorization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Queue is full: {0}")]
    QueueFull(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification used by status entries and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Validation,
    Authorization,
    Conflict,
    Storage,
    Other,
}

impl SyncError {
    /// Transient failures are retried with backoff; everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::Validation(_) | SyncError::QueueFull(_) => ErrorKind::Validation,
            SyncError::Authorization(_) => ErrorKind::Authorization,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Serialization(_) | SyncError::NotFound(_) | SyncError::Config(_) => {
                ErrorKind::Other
            }
        }
    }
}

impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::Network("request timed out".to_string())
    }
}
