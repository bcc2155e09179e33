//! Log backend trait definition.

use crate::error::StorageResult;

/// A low-level append-only store for Velum's write-ahead log.
///
/// Backends hold one active log plus any number of named archives.
/// The operations map onto the WAL's needs: buffered lines are
/// `append`ed, recovery and trimming `read_all`, trimming writes the
/// retained lines back with `replace`, and rotation moves the active
/// contents aside with `rotate`.
///
/// # Invariants
///
/// - `append` returns the offset at which the data landed
/// - `read_all` returns exactly the bytes appended (or replaced) so far
/// - `replace` is atomic: a crash leaves either the old or the new contents
/// - after `sync` returns, all prior writes survive process termination
///
/// # Implementors
///
/// - [`super::MemoryLog`] - for testing
/// - [`super::FileLog`] - for persistent storage
pub trait LogBackend: Send {
    /// Appends data to the end of the active log.
    ///
    /// Returns the offset where the data was written.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Reads the entire contents of the active log.
    fn read_all(&mut self) -> StorageResult<Vec<u8>>;

    /// Atomically replaces the active log contents.
    ///
    /// Used by WAL trimming: the retained lines are written out as a
    /// whole. After a crash the log holds either the previous or the
    /// new contents, never a mixture.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Archives the active log under `archive_name` and starts empty.
    ///
    /// For a file-backed log the archive becomes a sibling file of the
    /// active one. Fails with [`crate::StorageError::ArchiveExists`] if
    /// the name is already taken.
    fn rotate(&mut self, archive_name: &str) -> StorageResult<()>;

    /// Returns the current size of the active log in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs data and metadata to durable storage.
    ///
    /// This is a stronger guarantee than `flush`: after it returns the
    /// appended bytes survive power loss.
    fn sync(&mut self) -> StorageResult<()>;
}
