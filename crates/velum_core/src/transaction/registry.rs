//! Transaction registry.

use crate::error::{EngineError, EngineResult};
use crate::transaction::state::{OperationKind, TransactionRecord, TransactionStatus};
use crate::types::{LogOwner, Lsn, TransactionId};
use crate::wal::{LogOperation, Wal};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Tracks every transaction the engine has seen this process lifetime.
///
/// `begin` appends the BEGIN entry to the WAL and anchors the record at
/// its LSN. Finished records stay in the map with their terminal status
/// so that operations against them fail with a precise reason rather
/// than "unknown transaction".
pub struct TransactionRegistry {
    wal: Arc<Wal>,
    txns: RwLock<HashMap<TransactionId, TransactionRecord>>,
}

impl TransactionRegistry {
    /// Creates a registry writing BEGIN entries to `wal`.
    #[must_use]
    pub fn new(wal: Arc<Wal>) -> Self {
        Self {
            wal,
            txns: RwLock::new(HashMap::new()),
        }
    }

    /// Starts a new transaction and returns its ID. Never blocks.
    pub fn begin(&self) -> EngineResult<TransactionId> {
        let id = TransactionId::new();
        let start_lsn = self
            .wal
            .append(LogOwner::Transaction(id), LogOperation::Begin)?;
        self.txns
            .write()
            .insert(id, TransactionRecord::new(id, start_lsn));
        Ok(id)
    }

    /// Returns a snapshot of the record for `id`.
    #[must_use]
    pub fn get(&self, id: TransactionId) -> Option<TransactionRecord> {
        self.txns.read().get(&id).cloned()
    }

    /// Fails with `InvalidTransaction` unless `id` is known and active.
    pub fn ensure_active(&self, id: TransactionId) -> EngineResult<()> {
        match self.txns.read().get(&id).map(TransactionRecord::status) {
            Some(TransactionStatus::Active) => Ok(()),
            Some(TransactionStatus::Committed) => {
                Err(EngineError::invalid_transaction(id, "already committed"))
            }
            Some(TransactionStatus::Aborted) => {
                Err(EngineError::invalid_transaction(id, "already aborted"))
            }
            None => Err(EngineError::invalid_transaction(id, "unknown transaction")),
        }
    }

    /// Returns the LSN of the transaction's BEGIN entry.
    pub fn start_lsn(&self, id: TransactionId) -> EngineResult<Lsn> {
        self.txns
            .read()
            .get(&id)
            .map(TransactionRecord::start_lsn)
            .ok_or_else(|| EngineError::invalid_transaction(id, "unknown transaction"))
    }

    /// Appends a data operation to the transaction's op list.
    pub fn record_operation(
        &self,
        id: TransactionId,
        key: &str,
        kind: OperationKind,
    ) -> EngineResult<()> {
        let mut txns = self.txns.write();
        let record = txns
            .get_mut(&id)
            .ok_or_else(|| EngineError::invalid_transaction(id, "unknown transaction"))?;
        if !record.is_active() {
            return Err(EngineError::invalid_transaction(id, "not active"));
        }
        record.push_operation(key.to_string(), kind);
        Ok(())
    }

    /// Moves an active transaction to a terminal status.
    pub fn finalize(&self, id: TransactionId, status: TransactionStatus) -> EngineResult<()> {
        let mut txns = self.txns.write();
        let record = txns
            .get_mut(&id)
            .ok_or_else(|| EngineError::invalid_transaction(id, "unknown transaction"))?;
        if !record.is_active() {
            return Err(EngineError::invalid_transaction(id, "not active"));
        }
        record.set_status(status);
        Ok(())
    }

    /// Returns a snapshot of the IDs of all active transactions.
    #[must_use]
    pub fn active_ids(&self) -> Vec<TransactionId> {
        self.txns
            .read()
            .values()
            .filter(|record| record.is_active())
            .map(TransactionRecord::id)
            .collect()
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("active", &self.active_ids().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::EntryKind;
    use velum_storage::MemoryLog;

    fn registry() -> TransactionRegistry {
        let wal = Wal::open(Box::new(MemoryLog::new()), 100, 1024 * 1024, true).unwrap();
        TransactionRegistry::new(Arc::new(wal))
    }

    #[test]
    fn begin_writes_begin_entry_and_tracks_record() {
        let registry = registry();
        let id = registry.begin().unwrap();

        assert!(registry.ensure_active(id).is_ok());
        assert_eq!(registry.active_ids(), vec![id]);

        let entries = registry.wal.scan(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind(), EntryKind::Begin);
        assert_eq!(entries[0].txid(), Some(id));
        assert_eq!(registry.start_lsn(id).unwrap(), entries[0].lsn);
    }

    #[test]
    fn unknown_transaction_is_invalid() {
        let registry = registry();
        let ghost = TransactionId::new();
        assert!(matches!(
            registry.ensure_active(ghost),
            Err(EngineError::InvalidTransaction { .. })
        ));
    }

    #[test]
    fn record_operation_requires_active() {
        let registry = registry();
        let id = registry.begin().unwrap();
        registry
            .record_operation(id, "users", OperationKind::Write)
            .unwrap();

        registry.finalize(id, TransactionStatus::Committed).unwrap();
        assert!(matches!(
            registry.record_operation(id, "users", OperationKind::Delete),
            Err(EngineError::InvalidTransaction { .. })
        ));
    }

    #[test]
    fn finalize_is_terminal() {
        let registry = registry();
        let id = registry.begin().unwrap();
        registry.finalize(id, TransactionStatus::Aborted).unwrap();

        assert!(registry.finalize(id, TransactionStatus::Committed).is_err());
        assert!(registry.active_ids().is_empty());
        assert_eq!(
            registry.get(id).map(|r| r.status()),
            Some(TransactionStatus::Aborted)
        );
    }

    #[test]
    fn operations_snapshot_in_order() {
        let registry = registry();
        let id = registry.begin().unwrap();
        registry
            .record_operation(id, "a", OperationKind::Write)
            .unwrap();
        registry
            .record_operation(id, "b", OperationKind::Delete)
            .unwrap();

        let record = registry.get(id).unwrap();
        assert_eq!(record.operations().len(), 2);
        assert_eq!(record.operations()[0].key, "a");
        assert_eq!(record.operations()[1].kind, OperationKind::Delete);
    }
}
