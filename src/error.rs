//! Error types for webhook processing.
//!
//! Errors are classified by recoverability:
//! - Validation: malformed or incomplete payload — never retried
//! - Transient: downstream dependency or storage hiccup — retried with backoff
//! - Unsupported: recognized queue type, unknown event type — persisted for
//!   inspection, never retried

use thiserror::Error;

/// Error raised while processing a single queue item.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Unsupported event type: {0}")]
    Unsupported(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl ProcessingError {
    /// Whether the retry policy should re-queue the item with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessingError::Validation(_) | ProcessingError::Unsupported(_) => false,
            ProcessingError::Transient(_) => true,
            // Storage errors are assumed transient (locked db, disk pressure).
            ProcessingError::Store(_) => true,
        }
    }

    /// Short stable label recorded in metric samples and `last_error`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Validation(_) => "validation",
            ProcessingError::Transient(_) => "transient",
            ProcessingError::Unsupported(_) => "unsupported",
            ProcessingError::Store(_) => "store",
        }
    }
}

impl From<rusqlite::Error> for ProcessingError {
    fn from(err: rusqlite::Error) -> Self {
        ProcessingError::Store(StoreError::Sqlite(err))
    }
}

/// Errors specific to the SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}
