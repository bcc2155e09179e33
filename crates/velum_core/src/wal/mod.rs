//! Write-ahead log for durability and crash recovery.
//!
//! Every state-changing operation appends an entry here before anything
//! touches a document file. On crash, the log is replayed at startup to
//! redo committed transactions and undo interrupted ones.
//!
//! ## Wire Format
//!
//! One JSON object per line, newline-terminated:
//!
//! ```text
//! {"lsn":...,"transactionId":...,"operation":...,("key":...,)
//!  ("beforeImage":...,"afterImage":...,)"timestamp":...,"checksum":...}
//! ```
//!
//! The checksum is a lowercase hex SHA-256 over the other fields in a
//! canonical (sorted-key) serialization.
//!
//! ## Recovery Policy
//!
//! Every unreadable line is tolerated and skipped:
//!
//! - **Torn line**: a crash mid-append leaves a partial final line that
//!   fails to parse as JSON
//! - **Checksum mismatch**: bit rot or manual editing
//! - **Malformed entry**: fields that verify but don't form an entry
//!
//! Skipping is safe because the forced flush on COMMIT is the only
//! durability boundary: a commit whose record did not survive is, by
//! definition, not committed, and its transaction will be undone.
//!
//! ## Invariants
//!
//! - LSNs are unique and strictly increasing, across restarts
//! - COMMIT/ROLLBACK entries are on stable storage before `append` returns
//! - a committed transaction's COMMIT LSN exceeds all its data-op LSNs
//! - trimming retains exactly the COMMIT marker for the trimmed transaction

mod entry;
mod log;

pub use entry::{EntryKind, LineError, LogEntry, LogOperation};
pub use log::Wal;

/// File name of the active log within the data directory.
pub const WAL_FILE_NAME: &str = ".wal";
