//! The storage engine: transactional reads and writes over one data
//! directory, with WAL-backed durability and crash recovery.

use crate::config::Config;
use crate::dir::DataDir;
use crate::error::{EngineError, EngineResult};
use crate::lock::{LockManager, LockMode};
use crate::merge::deep_merge;
use crate::transaction::{OperationKind, TransactionRegistry, TransactionStatus};
use crate::types::{validate_key, LogOwner, Lsn, TransactionId};
use crate::wal::{LogOperation, Wal};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use velum_storage::FileLog;

/// An embedded transactional document store.
///
/// Keys map to JSON documents stored one file per key under the data
/// directory. All mutations go through transactions with strict
/// two-phase locking: locks taken by `write`, `read` and `delete` are
/// held until `commit` or `rollback`. Document files are only touched
/// when a transaction commits; until then its effects live solely in
/// the write-ahead log.
///
/// # Crash Recovery
///
/// Opening an engine replays the WAL in three passes:
///
/// 1. *Analysis* - partition transactions into committed (a COMMIT
///    record exists) and rolled back (a ROLLBACK exists, no COMMIT)
/// 2. *Redo* - in LSN order, re-apply every WRITE/DELETE of a committed
///    transaction; re-applying an already-applied effect is a no-op
/// 3. *Undo* - in reverse LSN order, restore the before-image of every
///    WRITE/DELETE belonging to a transaction that neither committed
///    nor rolled back, then append a ROLLBACK for it so later restarts
///    leave it alone
///
/// # Example
///
/// ```rust,ignore
/// use velum_core::StorageEngine;
/// use serde_json::json;
///
/// let engine = StorageEngine::open(Path::new("my_db"))?;
/// let txn = engine.begin_transaction()?;
/// engine.write(txn, "users", json!({"name": "ada"}))?;
/// engine.commit(txn)?;
/// ```
pub struct StorageEngine {
    config: Config,
    dir: DataDir,
    wal: Arc<Wal>,
    locks: LockManager,
    registry: TransactionRegistry,
    is_open: RwLock<bool>,
}

impl StorageEngine {
    /// Opens an engine over `path` with default configuration.
    pub fn open(path: &Path) -> EngineResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens an engine over `path`, running crash recovery.
    ///
    /// # Errors
    ///
    /// - another process holds the directory lock (`DirectoryLocked`)
    /// - the directory is missing and `create_if_missing` is off
    /// - I/O errors opening or replaying the WAL
    pub fn open_with_config(path: &Path, config: Config) -> EngineResult<Self> {
        let dir = DataDir::open(path, config.create_if_missing)?;

        let backend = FileLog::open(&dir.wal_path())?;
        let wal = Arc::new(Wal::open(
            Box::new(backend),
            config.wal_buffer_capacity,
            config.max_wal_size,
            config.sync_on_commit,
        )?);

        recover(&dir, &wal, config.pretty_documents)?;

        let registry = TransactionRegistry::new(Arc::clone(&wal));
        let locks = LockManager::new(config.lock_timeout);

        Ok(Self {
            config,
            dir,
            wal,
            locks,
            registry,
            is_open: RwLock::new(true),
        })
    }

    /// Starts a new transaction. Never blocks.
    pub fn begin_transaction(&self) -> EngineResult<TransactionId> {
        self.ensure_open()?;
        self.registry.begin()
    }

    /// Applies `patch` to `key` via deep-merge within a transaction.
    ///
    /// Takes the key's exclusive lock, records the WRITE entry with its
    /// before- and after-images, and returns. The document file is not
    /// modified until commit.
    pub fn write(&self, txn: TransactionId, key: &str, patch: Value) -> EngineResult<()> {
        self.ensure_open()?;
        validate_key(key)?;
        self.registry.ensure_active(txn)?;

        self.locks.acquire(key, txn, LockMode::Exclusive)?;

        let current = match self.in_transaction_effect(txn, key)? {
            Some(effect) => effect,
            None => match self.dir.read_document(key) {
                Ok(value) => value,
                // An unparseable file merges as if empty.
                Err(EngineError::DocumentParse { .. }) => None,
                Err(error) => return Err(error),
            },
        };

        let before = current.clone();
        let base = current.unwrap_or_else(|| Value::Object(Map::new()));
        let after = deep_merge(&base, &patch);

        self.wal.append(
            LogOwner::Transaction(txn),
            LogOperation::Write {
                key: key.to_string(),
                before,
                after,
            },
        )?;
        self.registry
            .record_operation(txn, key, OperationKind::Write)?;
        Ok(())
    }

    /// Reads the value visible to a transaction, or `None` if absent.
    ///
    /// Takes the key's shared lock. Pending in-transaction effects win
    /// over the on-disk state; a pending delete reads as `None`.
    pub fn read(&self, txn: TransactionId, key: &str) -> EngineResult<Option<Value>> {
        self.ensure_open()?;
        validate_key(key)?;
        self.registry.ensure_active(txn)?;

        self.locks.acquire(key, txn, LockMode::Shared)?;

        if let Some(effect) = self.in_transaction_effect(txn, key)? {
            return Ok(effect);
        }
        self.dir.read_document(key)
    }

    /// Deletes `key` within a transaction.
    ///
    /// Takes the key's exclusive lock and records a DELETE entry whose
    /// before-image is the current on-disk value. The file is unlinked
    /// only at commit.
    pub fn delete(&self, txn: TransactionId, key: &str) -> EngineResult<()> {
        self.ensure_open()?;
        validate_key(key)?;
        self.registry.ensure_active(txn)?;

        self.locks.acquire(key, txn, LockMode::Exclusive)?;

        let before = match self.dir.read_document(key) {
            Ok(value) => value,
            Err(EngineError::DocumentParse { .. }) => None,
            Err(error) => return Err(error),
        };

        self.wal.append(
            LogOwner::Transaction(txn),
            LogOperation::Delete {
                key: key.to_string(),
                before,
            },
        )?;
        self.registry
            .record_operation(txn, key, OperationKind::Delete)?;
        Ok(())
    }

    /// Commits a transaction.
    ///
    /// Appends the COMMIT entry and forces the WAL to stable storage -
    /// the durability point - then applies the transaction's effects to
    /// the document files, trims its records from the active log, and
    /// releases its locks.
    ///
    /// # Errors
    ///
    /// `CommitFailed` if the WAL flush or the apply step fails. If the
    /// COMMIT record was already durable, recovery on the next open
    /// re-applies the effects; the caller should not retry.
    pub fn commit(&self, txn: TransactionId) -> EngineResult<()> {
        self.ensure_open()?;
        self.registry.ensure_active(txn)?;
        let start_lsn = self.registry.start_lsn(txn)?;

        if let Err(error) = self.wal.append(LogOwner::Transaction(txn), LogOperation::Commit) {
            warn!(%txn, %error, "WAL flush failed during commit; rolling back");
            self.abort_after_failure(txn);
            return Err(EngineError::commit_failed(
                txn,
                format!("WAL flush failed: {error}"),
            ));
        }

        if let Err(error) = self.apply_effects(txn, start_lsn) {
            warn!(%txn, %error, "apply failed after durable COMMIT");
            self.abort_after_failure(txn);
            return Err(EngineError::commit_failed(
                txn,
                format!("commit is durable but applying changes failed; recovery will complete it: {error}"),
            ));
        }

        self.registry.finalize(txn, TransactionStatus::Committed)?;
        if let Err(error) = self.wal.trim_committed(txn) {
            warn!(%txn, %error, "WAL trim failed");
        }
        self.locks.release_all(txn);
        Ok(())
    }

    /// Rolls back a transaction.
    ///
    /// Appends a ROLLBACK entry, marks the transaction aborted and
    /// releases its locks. No document files need touching: effects are
    /// only applied at commit.
    pub fn rollback(&self, txn: TransactionId) -> EngineResult<()> {
        self.ensure_open()?;
        self.rollback_inner(txn)
    }

    /// Returns a snapshot of the active transaction IDs.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.registry.active_ids()
    }

    /// Appends a CHECKPOINT entry and flushes the WAL.
    pub fn force_checkpoint(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.wal.append(LogOwner::System, LogOperation::Checkpoint)?;
        self.wal.force_flush()?;
        debug!("checkpoint flushed");
        Ok(())
    }

    /// Shuts the engine down.
    ///
    /// Rolls back every active transaction (best-effort) and flushes
    /// the WAL. Subsequent operations fail with `EngineClosed`;
    /// shutting down twice is a no-op.
    pub fn shutdown(&self) -> EngineResult<()> {
        {
            let mut is_open = self.is_open.write();
            if !*is_open {
                return Ok(());
            }
            *is_open = false;
        }

        for txn in self.registry.active_ids() {
            if let Err(error) = self.rollback_inner(txn) {
                warn!(%txn, %error, "rollback during shutdown failed");
            }
        }
        self.wal.force_flush()?;
        Ok(())
    }

    /// Checks whether the engine accepts operations.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(EngineError::EngineClosed)
        }
    }

    /// Most recent in-transaction effect for `key`, if any.
    ///
    /// Scans the WAL from the transaction's BEGIN for its own WRITE and
    /// DELETE entries on this key. `Some(None)` means a pending delete.
    fn in_transaction_effect(
        &self,
        txn: TransactionId,
        key: &str,
    ) -> EngineResult<Option<Option<Value>>> {
        let start_lsn = self.registry.start_lsn(txn)?;
        let entries = self.wal.scan(Some(start_lsn))?;

        let mut effect = None;
        for entry in entries {
            if entry.txid() != Some(txn) {
                continue;
            }
            match entry.op {
                LogOperation::Write {
                    key: entry_key,
                    after,
                    ..
                } if entry_key == key => effect = Some(Some(after)),
                LogOperation::Delete { key: entry_key, .. } if entry_key == key => {
                    effect = Some(None);
                }
                _ => {}
            }
        }
        Ok(effect)
    }

    /// Replays a transaction's data entries against the document files.
    fn apply_effects(&self, txn: TransactionId, start_lsn: Lsn) -> EngineResult<()> {
        let entries = self.wal.scan(Some(start_lsn))?;
        for entry in entries {
            if entry.txid() != Some(txn) {
                continue;
            }
            match &entry.op {
                LogOperation::Write { key, after, .. } => {
                    self.dir
                        .write_document(key, after, self.config.pretty_documents)?;
                }
                LogOperation::Delete { key, .. } => {
                    self.dir.delete_document(key)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Best-effort abort used when a commit fails midway.
    fn abort_after_failure(&self, txn: TransactionId) {
        if let Err(error) = self
            .wal
            .append(LogOwner::Transaction(txn), LogOperation::Rollback)
        {
            warn!(%txn, %error, "could not append ROLLBACK after failed commit");
        }
        if let Err(error) = self.registry.finalize(txn, TransactionStatus::Aborted) {
            warn!(%txn, %error, "could not finalize transaction after failed commit");
        }
        self.locks.release_all(txn);
    }

    /// Rollback without the open check; shutdown uses this directly.
    fn rollback_inner(&self, txn: TransactionId) -> EngineResult<()> {
        self.registry.ensure_active(txn)?;

        let appended = self
            .wal
            .append(LogOwner::Transaction(txn), LogOperation::Rollback);
        self.registry.finalize(txn, TransactionStatus::Aborted)?;
        self.locks.release_all(txn);

        appended.map(|_| ())
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("root", &self.dir.root())
            .field("is_open", &self.is_open())
            .field("active_transactions", &self.active_transactions().len())
            .finish_non_exhaustive()
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        // Flush only: active transactions are deliberately left in the
        // log so recovery treats a dropped engine like a crash.
        let _ = self.wal.force_flush();
    }
}

/// Replays the WAL against the document files at startup.
fn recover(dir: &DataDir, wal: &Wal, pretty: bool) -> EngineResult<()> {
    let entries = wal.scan(None)?;
    if entries.is_empty() {
        return Ok(());
    }

    // Analysis: partition transactions by outcome.
    let mut seen: Vec<TransactionId> = Vec::new();
    let mut committed: HashSet<TransactionId> = HashSet::new();
    let mut rolled_back: HashSet<TransactionId> = HashSet::new();
    for entry in &entries {
        let Some(txn) = entry.txid() else { continue };
        if !seen.contains(&txn) {
            seen.push(txn);
        }
        match entry.op {
            LogOperation::Commit => {
                committed.insert(txn);
            }
            LogOperation::Rollback => {
                rolled_back.insert(txn);
            }
            _ => {}
        }
    }

    // Redo committed effects in LSN order.
    for entry in &entries {
        let Some(txn) = entry.txid() else { continue };
        if !committed.contains(&txn) {
            continue;
        }
        match &entry.op {
            LogOperation::Write { key, after, .. } => {
                dir.write_document(key, after, pretty)?;
            }
            LogOperation::Delete { key, .. } => {
                dir.delete_document(key)?;
            }
            _ => {}
        }
    }

    // Undo interrupted effects in reverse LSN order.
    for entry in entries.iter().rev() {
        let Some(txn) = entry.txid() else { continue };
        if committed.contains(&txn) || rolled_back.contains(&txn) {
            continue;
        }
        match &entry.op {
            LogOperation::Write { key, before, .. } | LogOperation::Delete { key, before } => {
                restore_before_image(dir, key, before.as_ref(), pretty)?;
            }
            _ => {}
        }
    }

    // Finalize interrupted transactions so later restarts skip them.
    let interrupted: Vec<TransactionId> = seen
        .iter()
        .copied()
        .filter(|txn| !committed.contains(txn) && !rolled_back.contains(txn))
        .collect();
    for txn in &interrupted {
        wal.append(LogOwner::Transaction(*txn), LogOperation::Rollback)?;
    }

    debug!(
        entries = entries.len(),
        committed = committed.len(),
        interrupted = interrupted.len(),
        "WAL recovery complete"
    );
    Ok(())
}

/// Writes a before-image back, or unlinks when the image is absent.
fn restore_before_image(
    dir: &DataDir,
    key: &str,
    before: Option<&Value>,
    pretty: bool,
) -> EngineResult<()> {
    match before {
        Some(value) => dir.write_document(key, value, pretty),
        None => dir.delete_document(key).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config() -> Config {
        Config::new().lock_timeout(Duration::from_millis(200))
    }

    fn open_engine(path: &Path) -> StorageEngine {
        StorageEngine::open_with_config(path, test_config()).unwrap()
    }

    #[test]
    fn write_then_read_in_same_transaction() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let txn = engine.begin_transaction().unwrap();
        engine.write(txn, "users", json!({"name": "ada"})).unwrap();

        let value = engine.read(txn, "users").unwrap();
        assert_eq!(value, Some(json!({"name": "ada"})));
    }

    #[test]
    fn committed_value_visible_to_later_transaction() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let writer = engine.begin_transaction().unwrap();
        engine.write(writer, "doc", json!({"v": 1})).unwrap();
        engine.commit(writer).unwrap();

        let reader = engine.begin_transaction().unwrap();
        assert_eq!(engine.read(reader, "doc").unwrap(), Some(json!({"v": 1})));
        engine.rollback(reader).unwrap();
    }

    #[test]
    fn uncommitted_write_touches_no_file() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let txn = engine.begin_transaction().unwrap();
        engine.write(txn, "doc", json!({"v": 1})).unwrap();

        assert!(!temp.path().join("doc.json").exists());
        engine.rollback(txn).unwrap();
        assert!(!temp.path().join("doc.json").exists());
    }

    #[test]
    fn pending_delete_reads_as_none() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let setup = engine.begin_transaction().unwrap();
        engine.write(setup, "doc", json!({"v": 1})).unwrap();
        engine.commit(setup).unwrap();

        let txn = engine.begin_transaction().unwrap();
        engine.delete(txn, "doc").unwrap();
        assert_eq!(engine.read(txn, "doc").unwrap(), None);

        // The file is still there until commit.
        assert!(temp.path().join("doc.json").exists());
        engine.commit(txn).unwrap();
        assert!(!temp.path().join("doc.json").exists());
    }

    #[test]
    fn commit_releases_locks() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let first = engine.begin_transaction().unwrap();
        engine.write(first, "doc", json!({"a": 1})).unwrap();
        engine.commit(first).unwrap();

        let second = engine.begin_transaction().unwrap();
        engine.write(second, "doc", json!({"b": 2})).unwrap();
        engine.commit(second).unwrap();
    }

    #[test]
    fn lock_contention_times_out() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let holder = engine.begin_transaction().unwrap();
        engine.write(holder, "doc", json!({"a": 1})).unwrap();

        let blocked = engine.begin_transaction().unwrap();
        let result = engine.write(blocked, "doc", json!({"b": 2}));
        assert!(matches!(result, Err(EngineError::LockTimeout { .. })));

        engine.rollback(blocked).unwrap();
        engine.commit(holder).unwrap();
    }

    #[test]
    fn finished_transaction_is_invalid() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let txn = engine.begin_transaction().unwrap();
        engine.commit(txn).unwrap();

        assert!(matches!(
            engine.write(txn, "doc", json!({})),
            Err(EngineError::InvalidTransaction { .. })
        ));
        assert!(matches!(
            engine.commit(txn),
            Err(EngineError::InvalidTransaction { .. })
        ));
        assert!(matches!(
            engine.rollback(txn),
            Err(EngineError::InvalidTransaction { .. })
        ));
    }

    #[test]
    fn invalid_keys_rejected() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let txn = engine.begin_transaction().unwrap();
        for key in ["", "a/b", "a\\b", "a..b"] {
            assert!(matches!(
                engine.write(txn, key, json!({})),
                Err(EngineError::InvalidKey { .. })
            ));
        }
        engine.rollback(txn).unwrap();
    }

    #[test]
    fn active_transactions_snapshot() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let a = engine.begin_transaction().unwrap();
        let b = engine.begin_transaction().unwrap();

        let mut active = engine.active_transactions();
        active.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(active, expected);

        engine.rollback(a).unwrap();
        assert_eq!(engine.active_transactions(), vec![b]);
        engine.commit(b).unwrap();
        assert!(engine.active_transactions().is_empty());
    }

    #[test]
    fn shutdown_rolls_back_and_closes() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let txn = engine.begin_transaction().unwrap();
        engine.write(txn, "doc", json!({"v": 1})).unwrap();

        engine.shutdown().unwrap();
        assert!(!engine.is_open());
        assert!(matches!(
            engine.begin_transaction(),
            Err(EngineError::EngineClosed)
        ));
        // Idempotent.
        engine.shutdown().unwrap();
        drop(engine);

        // The write was rolled back, not committed.
        let reopened = open_engine(temp.path());
        let reader = reopened.begin_transaction().unwrap();
        assert_eq!(reopened.read(reader, "doc").unwrap(), None);
    }

    #[test]
    fn force_checkpoint_appends_system_entry() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());
        engine.force_checkpoint().unwrap();

        let entries = engine.wal.scan(None).unwrap();
        assert!(entries
            .iter()
            .any(|e| e.owner == LogOwner::System
                && matches!(e.op, LogOperation::Checkpoint)));
    }

    #[test]
    fn commit_trims_wal_to_marker() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        let txn = engine.begin_transaction().unwrap();
        engine.write(txn, "doc", json!({"v": 1})).unwrap();
        engine.commit(txn).unwrap();

        let entries = engine.wal.scan(None).unwrap();
        let mine: Vec<_> = entries.iter().filter(|e| e.txid() == Some(txn)).collect();
        assert_eq!(mine.len(), 1);
        assert!(matches!(mine[0].op, LogOperation::Commit));
    }

    #[test]
    fn unparseable_document_merges_as_empty_in_write_path() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        std::fs::write(temp.path().join("bad.json"), "{corrupt").unwrap();

        let txn = engine.begin_transaction().unwrap();
        engine.write(txn, "bad", json!({"fixed": true})).unwrap();
        engine.commit(txn).unwrap();

        let reader = engine.begin_transaction().unwrap();
        assert_eq!(
            engine.read(reader, "bad").unwrap(),
            Some(json!({"fixed": true}))
        );
    }

    #[test]
    fn unparseable_document_errors_in_read_path() {
        let temp = tempdir().unwrap();
        let engine = open_engine(temp.path());

        std::fs::write(temp.path().join("bad.json"), "{corrupt").unwrap();

        let txn = engine.begin_transaction().unwrap();
        assert!(matches!(
            engine.read(txn, "bad"),
            Err(EngineError::DocumentParse { .. })
        ));
        engine.rollback(txn).unwrap();
    }
}
