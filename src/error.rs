//! Error types for the geostore engine and runtime

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Tuple store is read only: {0}")]
    ReadOnly(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Outdated version: {0}")]
    Outdated(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Space partitioner error: {0}")]
    Partitioner(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Shutdown in progress")]
    Shutdown,
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Outcome of waiting on a client future.
///
/// A remote failure is reported separately from a timeout so callers can
/// tell "not yet complete" apart from "completed with an error".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FutureError {
    #[error("timeout after {0} ms")]
    Timeout(u64),

    #[error("wait cancelled")]
    Cancelled,

    #[error("operation failed: {0}")]
    Failed(String),
}
