//! Error types for the Velum engine.

use crate::types::TransactionId;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the Velum engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A document key failed the safety checks.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An operation referenced an unknown or finished transaction.
    #[error("invalid transaction {id}: {reason}")]
    InvalidTransaction {
        /// The offending transaction ID.
        id: TransactionId,
        /// Why the transaction cannot be used.
        reason: String,
    },

    /// A lock could not be acquired within the deadlock timeout.
    ///
    /// The owning transaction is presumed deadlocked; the caller must
    /// roll it back.
    #[error("lock timeout on key {key:?} for transaction {txn}")]
    LockTimeout {
        /// The contested key.
        key: String,
        /// The transaction whose acquire timed out.
        txn: TransactionId,
    },

    /// A queued lock request was cancelled because its transaction was
    /// rolled back.
    #[error("transaction {txn} aborted while waiting for a lock")]
    TransactionAborted {
        /// The aborted transaction.
        txn: TransactionId,
    },

    /// An I/O failure on the write-ahead log.
    #[error("WAL I/O error: {0}")]
    WalIo(#[from] velum_storage::StorageError),

    /// A commit could not be completed.
    ///
    /// If the COMMIT record was already durable when the failure hit,
    /// the transaction WILL be re-applied by recovery on the next open;
    /// the caller should not retry it.
    #[error("commit failed for transaction {txn}: {message}")]
    CommitFailed {
        /// The transaction whose commit failed.
        txn: TransactionId,
        /// Description of the failure.
        message: String,
    },

    /// An on-disk document is not valid JSON.
    #[error("document {key:?} is not valid JSON: {source}")]
    DocumentParse {
        /// The document key.
        key: String,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// Another process holds the data directory lock.
    #[error("data directory locked: another process has exclusive access")]
    DirectoryLocked,

    /// The engine has been shut down.
    #[error("engine is shut down")]
    EngineClosed,

    /// An I/O error outside the WAL (document files, directory setup).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Creates an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid transaction error.
    pub fn invalid_transaction(id: TransactionId, reason: impl Into<String>) -> Self {
        Self::InvalidTransaction {
            id,
            reason: reason.into(),
        }
    }

    /// Creates a lock timeout error.
    pub fn lock_timeout(key: impl Into<String>, txn: TransactionId) -> Self {
        Self::LockTimeout {
            key: key.into(),
            txn,
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(txn: TransactionId) -> Self {
        Self::TransactionAborted { txn }
    }

    /// Creates a commit failed error.
    pub fn commit_failed(txn: TransactionId, message: impl Into<String>) -> Self {
        Self::CommitFailed {
            txn,
            message: message.into(),
        }
    }

    /// Creates a document parse error.
    pub fn document_parse(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::DocumentParse {
            key: key.into(),
            source,
        }
    }
}
