//! Data directory management.
//!
//! This module owns the on-disk layout:
//!
//! ```text
//! <db_root>/
//! ├─ <key>.json            one pretty-printed document per live key
//! ├─ .wal                  active write-ahead log
//! ├─ .wal.<ISO-timestamp>  rotated WAL archives (informational)
//! └─ .lock                 advisory lock for single-process access
//! ```
//!
//! The `.lock` file ensures only one engine writes to the directory at
//! a time. Document writes go through a write-then-rename so a crash
//! never leaves a half-written `<key>.json`.

use crate::error::{EngineError, EngineResult};
use crate::wal::WAL_FILE_NAME;
use fs2::FileExt;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".lock";
const DOC_EXTENSION: &str = "json";

/// Manages the data directory layout and its advisory lock.
///
/// Only one `DataDir` instance can exist per directory at a time; the
/// lock is released when the instance is dropped.
#[derive(Debug)]
pub struct DataDir {
    root: PathBuf,
    /// Lock file handle, held for exclusive access.
    _lock_file: File,
}

impl DataDir {
    /// Opens or creates a data directory.
    ///
    /// # Errors
    ///
    /// - the directory doesn't exist and `create_if_missing` is false
    /// - another process holds the lock (`DirectoryLocked`)
    /// - I/O errors
    pub fn open(root: &Path, create_if_missing: bool) -> EngineResult<Self> {
        if !root.exists() {
            if create_if_missing {
                fs::create_dir_all(root)?;
            } else {
                return Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("data directory does not exist: {}", root.display()),
                )));
            }
        }

        if !root.is_dir() {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path is not a directory: {}", root.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(EngineError::DirectoryLocked);
        }

        Ok(Self {
            root: root.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the active WAL file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.root.join(WAL_FILE_NAME)
    }

    /// Returns the path of a document file. The key must be validated.
    #[must_use]
    pub fn document_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{DOC_EXTENSION}"))
    }

    /// Checks whether a document file exists.
    #[must_use]
    pub fn document_exists(&self, key: &str) -> bool {
        self.document_path(key).exists()
    }

    /// Reads and parses a document.
    ///
    /// An absent or empty file is the explicit state `None`. A file
    /// that exists but does not parse fails with `DocumentParse`.
    pub fn read_document(&self, key: &str) -> EngineResult<Option<Value>> {
        let path = self.document_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)?;
        if contents.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| EngineError::document_parse(key, source))
    }

    /// Atomically writes a document.
    ///
    /// The value is written to a temp file, synced, and renamed over
    /// the target; the directory is then fsynced so the rename is
    /// durable.
    pub fn write_document(&self, key: &str, value: &Value, pretty: bool) -> EngineResult<()> {
        let path = self.document_path(key);
        let temp_path = self.root.join(format!("{key}.{DOC_EXTENSION}.tmp"));

        let contents = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|source| EngineError::document_parse(key, source))?;

        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(contents.as_bytes())?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        self.sync_root()?;

        Ok(())
    }

    /// Removes a document file if present. Returns whether it existed.
    pub fn delete_document(&self, key: &str) -> EngineResult<bool> {
        let path = self.document_path(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        self.sync_root()?;
        Ok(true)
    }

    /// Fsyncs the directory so renames and unlinks are durable.
    #[cfg(unix)]
    fn sync_root(&self) -> EngineResult<()> {
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_root(&self) -> EngineResult<()> {
        // NTFS journaling covers metadata durability; directory fsync is
        // not supported the way it is on Unix.
        Ok(())
    }
}
