//! Engine configuration.

use std::time::Duration;

/// Configuration for opening a storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the data directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Number of WAL entries buffered in memory before a flush.
    ///
    /// COMMIT and ROLLBACK entries always force a flush regardless of
    /// how full the buffer is.
    pub wal_buffer_capacity: usize,

    /// WAL size past which the log is rotated after a flush.
    pub max_wal_size: u64,

    /// Upper bound on lock-acquire waits.
    ///
    /// This is the engine's sole deadlock-avoidance mechanism: an
    /// acquire that waits longer than this fails and the owning
    /// transaction must be rolled back.
    pub lock_timeout: Duration,

    /// Whether the forced flush on COMMIT/ROLLBACK also syncs to
    /// stable storage (safer but slower).
    ///
    /// With this off, commit records are pushed to the OS but a power
    /// loss can still discard them; a crashed process loses nothing.
    pub sync_on_commit: bool,

    /// Whether document files are pretty-printed.
    pub pretty_documents: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            wal_buffer_capacity: 100,
            max_wal_size: 10 * 1024 * 1024, // 10 MiB
            lock_timeout: Duration::from_secs(30),
            sync_on_commit: true,
            pretty_documents: true,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the WAL buffer capacity.
    #[must_use]
    pub const fn wal_buffer_capacity(mut self, entries: usize) -> Self {
        self.wal_buffer_capacity = entries;
        self
    }

    /// Sets the WAL rotation threshold.
    #[must_use]
    pub const fn max_wal_size(mut self, bytes: u64) -> Self {
        self.max_wal_size = bytes;
        self
    }

    /// Sets the lock-acquire timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether to sync the WAL on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether document files are pretty-printed.
    #[must_use]
    pub const fn pretty_documents(mut self, value: bool) -> Self {
        self.pretty_documents = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert_eq!(config.wal_buffer_capacity, 100);
        assert_eq!(config.max_wal_size, 10 * 1024 * 1024);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert!(config.sync_on_commit);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .wal_buffer_capacity(1)
            .sync_on_commit(false)
            .lock_timeout(Duration::from_millis(50));

        assert!(!config.create_if_missing);
        assert_eq!(config.wal_buffer_capacity, 1);
        assert!(!config.sync_on_commit);
        assert_eq!(config.lock_timeout, Duration::from_millis(50));
    }
}
