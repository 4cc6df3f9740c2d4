//! Error types shared across the index engine.
//!
//! The taxonomy follows the failure model of the build/query pipeline:
//! malformed input is recovered locally (skip and log), build-pipeline and
//! swap failures are fatal to the current attempt but leave the previously
//! installed index intact, and query-time I/O failures terminate the current
//! iteration without poisoning other queries.

use std::io;
use thiserror::Error;

/// Errors that can occur in index build and query operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Build failed at stage {stage}: {message}")]
    BuildFailed { stage: String, message: String },

    #[error("External command {command} exited with status {status}")]
    ExternalCommand { command: String, status: i32 },

    #[error("Category {0} not found")]
    CategoryNotFound(String),

    #[error("Category {0} is already loading")]
    LoadInProgress(String),

    #[error("Index is closed")]
    Closed,
}

impl From<fjall::Error> for IndexError {
    fn from(err: fjall::Error) -> Self {
        IndexError::Store(err.to_string())
    }
}

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;
