//! The write-ahead log manager.

use crate::error::EngineResult;
use crate::types::{LogOwner, Lsn, TransactionId};
use crate::wal::entry::{EntryKind, LogEntry, LogOperation};
use crate::wal::WAL_FILE_NAME;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use velum_storage::LogBackend;

/// Buffered, checksummed write-ahead log.
///
/// Appends accumulate in a memory buffer and are flushed either when
/// the buffer reaches its capacity or, unconditionally, when a COMMIT
/// or ROLLBACK entry lands. With `sync_on_commit` the forced flush is
/// also synced to stable storage; that is the sole durability boundary
/// the engine relies on.
///
/// The next LSN is recovered from the existing log at open: unreadable
/// lines (truncated tails, checksum failures) are skipped, so a crash
/// mid-write costs at most the final partial line.
pub struct Wal {
    state: Mutex<WalState>,
    buffer_capacity: usize,
    max_size: u64,
    sync_on_commit: bool,
}

struct WalState {
    backend: Box<dyn LogBackend>,
    buffer: Vec<LogEntry>,
    next_lsn: u64,
}

impl Wal {
    /// Opens the log over a backend, recovering the LSN counter.
    ///
    /// `buffer_capacity` is the number of entries held before a flush;
    /// `max_size` is the byte threshold past which the log is rotated;
    /// `sync_on_commit` controls whether the forced flush on COMMIT and
    /// ROLLBACK also syncs to stable storage.
    pub fn open(
        mut backend: Box<dyn LogBackend>,
        buffer_capacity: usize,
        max_size: u64,
        sync_on_commit: bool,
    ) -> EngineResult<Self> {
        let bytes = backend.read_all()?;
        let text = String::from_utf8_lossy(&bytes);

        let mut max_lsn = 0u64;
        let mut skipped = 0usize;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match LogEntry::from_line(line) {
                Ok(entry) => max_lsn = max_lsn.max(entry.lsn.as_u64()),
                Err(error) => {
                    skipped += 1;
                    trace!(%error, "skipping unreadable WAL line");
                }
            }
        }
        if skipped > 0 {
            debug!(skipped, "ignored unreadable WAL lines while recovering LSN");
        }

        Ok(Self {
            state: Mutex::new(WalState {
                backend,
                buffer: Vec::new(),
                next_lsn: max_lsn + 1,
            }),
            buffer_capacity,
            max_size,
            sync_on_commit,
        })
    }

    /// Appends an entry, assigning it the next LSN.
    ///
    /// COMMIT and ROLLBACK entries force a flush (synced to stable
    /// storage under `sync_on_commit`) before this returns; other
    /// entries flush only once the buffer is full.
    pub fn append(&self, owner: LogOwner, op: LogOperation) -> EngineResult<Lsn> {
        let mut state = self.state.lock();

        let lsn = Lsn::new(state.next_lsn);
        state.next_lsn += 1;
        let forced = matches!(op.kind(), EntryKind::Commit | EntryKind::Rollback);
        state.buffer.push(LogEntry {
            lsn,
            owner,
            op,
            timestamp_ms: now_ms(),
        });

        if forced {
            flush_buffer(&mut state)?;
            if self.sync_on_commit {
                state.backend.sync()?;
            } else {
                state.backend.flush()?;
            }
            self.maybe_rotate(&mut state);
        } else if state.buffer.len() >= self.buffer_capacity {
            flush_buffer(&mut state)?;
            self.maybe_rotate(&mut state);
        }

        Ok(lsn)
    }

    /// Flushes buffered entries and syncs them to stable storage.
    pub fn force_flush(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        flush_buffer(&mut state)?;
        state.backend.sync()?;
        Ok(())
    }

    /// Returns all readable entries at or past `from`, sorted by LSN.
    ///
    /// The result merges the on-disk log with the in-memory buffer, so
    /// entries that have not been flushed yet are still visible. Lines
    /// that fail to parse or verify are silently skipped.
    pub fn scan(&self, from: Option<Lsn>) -> EngineResult<Vec<LogEntry>> {
        let mut state = self.state.lock();
        let bytes = state.backend.read_all()?;
        let text = String::from_utf8_lossy(&bytes);

        let mut entries = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match LogEntry::from_line(line) {
                Ok(entry) => entries.push(entry),
                Err(error) => trace!(%error, "skipping unreadable WAL line"),
            }
        }
        entries.extend(state.buffer.iter().cloned());
        drop(state);

        if let Some(from) = from {
            entries.retain(|entry| entry.lsn >= from);
        }
        entries.sort_by_key(|entry| entry.lsn);
        Ok(entries)
    }

    /// Removes a committed transaction's records from the active log.
    ///
    /// The transaction's single COMMIT line is retained as a durable
    /// marker; its BEGIN/WRITE/DELETE lines are dropped. Lines owned by
    /// other transactions are kept, and unreadable lines are carried
    /// over byte-for-byte rather than widening the loss.
    ///
    /// Trimming is an optimization, not a correctness requirement.
    pub fn trim_committed(&self, txn: TransactionId) -> EngineResult<()> {
        let mut state = self.state.lock();
        flush_buffer(&mut state)?;

        let bytes = state.backend.read_all()?;
        let text = String::from_utf8_lossy(&bytes);

        let mut retained = String::with_capacity(text.len());
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let keep = match LogEntry::from_line(line) {
                Err(_) => true,
                Ok(entry) => entry.txid() != Some(txn) || entry.kind() == EntryKind::Commit,
            };
            if keep {
                retained.push_str(line);
                retained.push('\n');
            }
        }

        state.backend.replace(retained.as_bytes())?;
        Ok(())
    }

    /// Returns the LSN the next append will receive.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        Lsn::new(self.state.lock().next_lsn)
    }

    /// Rotates the log if it grew past the size threshold. Best-effort.
    fn maybe_rotate(&self, state: &mut WalState) {
        let size = match state.backend.size() {
            Ok(size) => size,
            Err(error) => {
                warn!(%error, "could not determine WAL size");
                return;
            }
        };
        if size <= self.max_size {
            return;
        }

        let archive = format!(
            "{WAL_FILE_NAME}.{}",
            Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ")
        );
        if let Err(error) = rotate(state, &archive) {
            warn!(%error, %archive, "WAL rotation failed");
        } else {
            debug!(%archive, "rotated WAL");
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("max_size", &self.max_size)
            .field("sync_on_commit", &self.sync_on_commit)
            .field("next_lsn", &self.next_lsn())
            .finish_non_exhaustive()
    }
}

/// Serializes the buffer as JSON lines and appends it to the backend.
fn flush_buffer(state: &mut WalState) -> EngineResult<()> {
    if state.buffer.is_empty() {
        return Ok(());
    }

    let mut lines = String::new();
    for entry in &state.buffer {
        lines.push_str(&entry.to_line());
        lines.push('\n');
    }
    state.backend.append(lines.as_bytes())?;
    state.buffer.clear();
    Ok(())
}

/// Archives the current log and starts a fresh one with a CHECKPOINT.
fn rotate(state: &mut WalState, archive: &str) -> EngineResult<()> {
    state.backend.rotate(archive)?;

    let lsn = Lsn::new(state.next_lsn);
    state.next_lsn += 1;
    let checkpoint = LogEntry {
        lsn,
        owner: LogOwner::System,
        op: LogOperation::Checkpoint,
        timestamp_ms: now_ms(),
    };
    let mut line = checkpoint.to_line();
    line.push('\n');
    state.backend.append(line.as_bytes())?;
    state.backend.sync()?;
    Ok(())
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
