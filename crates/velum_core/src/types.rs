//! Core identifier types and key safety checks.

use crate::error::{EngineError, EngineResult};
use std::fmt;
use uuid::Uuid;

/// Log sequence number.
///
/// LSNs are unique and strictly increasing across the process lifetime
/// and across restarts; the next LSN is recovered from the existing log
/// at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Creates an LSN from its raw value.
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next LSN.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Unique identifier for a transaction.
///
/// Transaction IDs are random UUIDs and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generates a fresh transaction ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parses a hyphenated UUID string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The reserved owner name for engine-generated WAL entries.
pub const SYSTEM_OWNER: &str = "SYSTEM";

/// Owner of a WAL entry: a transaction, or the engine itself.
///
/// CHECKPOINT entries are owned by the engine and carry the literal
/// `SYSTEM` on the wire instead of a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogOwner {
    /// Entry written on behalf of a transaction.
    Transaction(TransactionId),
    /// Entry written by the engine (checkpoints).
    System,
}

impl LogOwner {
    /// Returns the owning transaction, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        match self {
            Self::Transaction(id) => Some(*id),
            Self::System => None,
        }
    }

    /// Renders the wire form: a hyphenated UUID or `SYSTEM`.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Transaction(id) => id.to_string(),
            Self::System => SYSTEM_OWNER.to_string(),
        }
    }

    /// Parses the wire form.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        if s == SYSTEM_OWNER {
            Some(Self::System)
        } else {
            TransactionId::parse(s).map(Self::Transaction)
        }
    }
}

impl fmt::Display for LogOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Validates a document key.
///
/// Keys name files directly under the data directory, so they must be
/// non-empty and free of path separators and `..` segments.
pub fn validate_key(key: &str) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::invalid_key(key, "key must not be empty"));
    }
    if key.contains('/') || key.contains('\\') {
        return Err(EngineError::invalid_key(
            key,
            "key must not contain path separators",
        ));
    }
    if key.contains("..") {
        return Err(EngineError::invalid_key(key, "key must not contain '..'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_ordering_and_next() {
        let a = Lsn::new(1);
        let b = a.next();
        assert!(a < b);
        assert_eq!(b.as_u64(), 2);
    }

    #[test]
    fn transaction_ids_are_unique() {
        assert_ne!(TransactionId::new(), TransactionId::new());
    }

    #[test]
    fn transaction_id_round_trips_through_wire_form() {
        let id = TransactionId::new();
        let parsed = TransactionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn owner_wire_forms() {
        assert_eq!(LogOwner::System.to_wire(), "SYSTEM");
        assert_eq!(LogOwner::from_wire("SYSTEM"), Some(LogOwner::System));

        let id = TransactionId::new();
        let owner = LogOwner::Transaction(id);
        assert_eq!(LogOwner::from_wire(&owner.to_wire()), Some(owner));
        assert_eq!(owner.transaction(), Some(id));
        assert_eq!(LogOwner::System.transaction(), None);
    }

    #[test]
    fn owner_rejects_garbage() {
        assert_eq!(LogOwner::from_wire("not-a-uuid"), None);
    }

    #[test]
    fn valid_keys_pass() {
        for key in ["users", "user-1", "user.profile", "a b c", "café"] {
            assert!(validate_key(key).is_ok(), "expected {key:?} to be valid");
        }
    }

    #[test]
    fn invalid_keys_fail() {
        for key in ["", "a/b", "a\\b", "..", "a..b", "../etc"] {
            assert!(
                matches!(validate_key(key), Err(EngineError::InvalidKey { .. })),
                "expected {key:?} to be rejected"
            );
        }
    }
}
