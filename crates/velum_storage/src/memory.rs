//! In-memory log backend for testing.

use crate::backend::LogBackend;
use crate::error::{StorageError, StorageResult};
use std::collections::BTreeMap;

/// An in-memory log backend.
///
/// Stores the active log in a byte vector and keeps rotated archives in
/// a map so tests can assert on rotation behavior. Suitable for unit
/// tests and ephemeral engines; nothing survives the process.
///
/// # Example
///
/// ```rust
/// use velum_storage::{LogBackend, MemoryLog};
///
/// let mut backend = MemoryLog::new();
/// backend.append(b"line\n").unwrap();
/// assert_eq!(backend.size().unwrap(), 5);
/// ```
#[derive(Debug, Default)]
pub struct MemoryLog {
    data: Vec<u8>,
    archives: BTreeMap<String, Vec<u8>>,
}

impl MemoryLog {
    /// Creates a new empty in-memory log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an in-memory log with pre-existing contents.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            archives: BTreeMap::new(),
        }
    }

    /// Returns a copy of the active log contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.clone()
    }

    /// Returns the archive written under `name` by a rotation, if any.
    #[must_use]
    pub fn archive(&self, name: &str) -> Option<&[u8]> {
        self.archives.get(name).map(Vec::as_slice)
    }

    /// Returns the names of all archives, in lexical order.
    #[must_use]
    pub fn archive_names(&self) -> Vec<String> {
        self.archives.keys().cloned().collect()
    }
}

impl LogBackend for MemoryLog {
    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(data);
        Ok(offset)
    }

    fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.data = data.to_vec();
        Ok(())
    }

    fn rotate(&mut self, archive_name: &str) -> StorageResult<()> {
        if self.archives.contains_key(archive_name) {
            return Err(StorageError::ArchiveExists {
                name: archive_name.to_string(),
            });
        }
        let contents = std::mem::take(&mut self.data);
        self.archives.insert(archive_name.to_string(), contents);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.len() as u64)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
