//! Error types for log storage operations.

use std::io;
use thiserror::Error;

/// Result type for log storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in a log backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An archive with the requested name already exists.
    #[error("archive already exists: {name}")]
    ArchiveExists {
        /// The colliding archive name.
        name: String,
    },
}
