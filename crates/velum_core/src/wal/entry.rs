//! WAL entry types and the JSON-line wire codec.

use crate::types::{LogOwner, Lsn, TransactionId};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};
use thiserror::Error;

/// Kind of WAL entry as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A transaction started.
    Begin,
    /// A document was patched.
    Write,
    /// A document was deleted.
    Delete,
    /// A transaction committed.
    Commit,
    /// A transaction rolled back.
    Rollback,
    /// Checkpoint marker.
    Checkpoint,
}

impl EntryKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::Write => "WRITE",
            Self::Delete => "DELETE",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::Checkpoint => "CHECKPOINT",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "BEGIN" => Some(Self::Begin),
            "WRITE" => Some(Self::Write),
            "DELETE" => Some(Self::Delete),
            "COMMIT" => Some(Self::Commit),
            "ROLLBACK" => Some(Self::Rollback),
            "CHECKPOINT" => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind payload of a WAL entry.
///
/// BEGIN, COMMIT, ROLLBACK and CHECKPOINT carry only header fields;
/// WRITE and DELETE add the document key and its images. The flat JSON
/// shape on the wire is retained for compatibility with existing logs.
#[derive(Debug, Clone, PartialEq)]
pub enum LogOperation {
    /// A transaction started.
    Begin,
    /// A document was patched.
    Write {
        /// The document key.
        key: String,
        /// Value immediately before the write; `None` if absent.
        before: Option<Value>,
        /// Value immediately after the write.
        after: Value,
    },
    /// A document was deleted.
    Delete {
        /// The document key.
        key: String,
        /// Value immediately before the delete; `None` if absent.
        before: Option<Value>,
    },
    /// A transaction committed.
    Commit,
    /// A transaction rolled back.
    Rollback,
    /// Checkpoint marker.
    Checkpoint,
}

impl LogOperation {
    /// Returns the entry kind.
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Begin => EntryKind::Begin,
            Self::Write { .. } => EntryKind::Write,
            Self::Delete { .. } => EntryKind::Delete,
            Self::Commit => EntryKind::Commit,
            Self::Rollback => EntryKind::Rollback,
            Self::Checkpoint => EntryKind::Checkpoint,
        }
    }

    /// Returns the document key for WRITE/DELETE entries.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Write { key, .. } | Self::Delete { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// A single WAL entry.
///
/// On the wire an entry is one JSON object per line:
///
/// ```json
/// {"lsn":7,"transactionId":"<uuid>","operation":"WRITE","key":"users",
///  "beforeImage":null,"afterImage":{"name":"ada"},"timestamp":1700000000000,
///  "checksum":"<hex sha-256>"}
/// ```
///
/// The checksum is the lowercase hex SHA-256 of the entry serialized
/// without its `checksum` field, with object keys in sorted order. An
/// entry whose checksum does not verify is treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Log sequence number.
    pub lsn: Lsn,
    /// Owning transaction, or the engine for checkpoints.
    pub owner: LogOwner,
    /// The operation payload.
    pub op: LogOperation,
    /// Wall-clock milliseconds at append; informational only.
    pub timestamp_ms: u64,
}

/// Why a WAL line could not be decoded.
#[derive(Debug, Error)]
pub enum LineError {
    /// The line is not a JSON object.
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The stored checksum does not match the recomputed one.
    #[error("checksum mismatch: expected {expected}, found {found}")]
    Checksum {
        /// Checksum recomputed from the line contents.
        expected: String,
        /// Checksum stored on the line.
        found: String,
    },

    /// The line verified but its fields do not form a valid entry.
    #[error("malformed entry: {0}")]
    Malformed(&'static str),
}

/// Decode-side view of the flat wire object (checksum already stripped).
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntry {
    lsn: u64,
    transaction_id: String,
    operation: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default, deserialize_with = "present_or_null")]
    before_image: Option<Option<Value>>,
    #[serde(default, deserialize_with = "present_or_null")]
    after_image: Option<Option<Value>>,
    timestamp: u64,
}

/// Distinguishes an explicit `null` (`Some(None)`) from an absent field
/// (`None` via the `default`).
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Value>::deserialize(deserializer).map(Some)
}

impl LogEntry {
    /// Returns the owning transaction, if any.
    #[must_use]
    pub fn txid(&self) -> Option<TransactionId> {
        self.owner.transaction()
    }

    /// Returns the entry kind.
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.op.kind()
    }

    /// Serializes the entry to its wire line (without trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut fields = self.wire_fields();
        let digest = sha256_hex(Value::Object(fields.clone()).to_string().as_bytes());
        fields.insert("checksum".to_string(), Value::String(digest));
        Value::Object(fields).to_string()
    }

    /// Builds the flat wire object without the checksum field.
    fn wire_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("lsn".to_string(), Value::from(self.lsn.as_u64()));
        fields.insert(
            "transactionId".to_string(),
            Value::String(self.owner.to_wire()),
        );
        fields.insert(
            "operation".to_string(),
            Value::String(self.kind().as_str().to_string()),
        );

        match &self.op {
            LogOperation::Write { key, before, after } => {
                fields.insert("key".to_string(), Value::String(key.clone()));
                fields.insert(
                    "beforeImage".to_string(),
                    before.clone().unwrap_or(Value::Null),
                );
                fields.insert("afterImage".to_string(), after.clone());
            }
            LogOperation::Delete { key, before } => {
                fields.insert("key".to_string(), Value::String(key.clone()));
                fields.insert(
                    "beforeImage".to_string(),
                    before.clone().unwrap_or(Value::Null),
                );
                fields.insert("afterImage".to_string(), Value::Null);
            }
            _ => {}
        }

        fields.insert("timestamp".to_string(), Value::from(self.timestamp_ms));
        fields
    }

    /// Decodes and verifies one wire line.
    pub fn from_line(line: &str) -> Result<Self, LineError> {
        let parsed: Value = serde_json::from_str(line)?;
        let Value::Object(mut fields) = parsed else {
            return Err(LineError::Malformed("entry is not a JSON object"));
        };

        let found = match fields.remove("checksum") {
            Some(Value::String(found)) => found,
            _ => return Err(LineError::Malformed("missing checksum")),
        };
        let expected = sha256_hex(Value::Object(fields.clone()).to_string().as_bytes());
        if expected != found {
            return Err(LineError::Checksum { expected, found });
        }

        let wire: WireEntry = serde_json::from_value(Value::Object(fields))?;

        let owner = LogOwner::from_wire(&wire.transaction_id)
            .ok_or(LineError::Malformed("unrecognized transactionId"))?;
        let kind =
            EntryKind::parse(&wire.operation).ok_or(LineError::Malformed("unknown operation"))?;

        let op = match kind {
            EntryKind::Begin | EntryKind::Commit | EntryKind::Rollback => {
                if owner.transaction().is_none() {
                    return Err(LineError::Malformed("transaction entry owned by SYSTEM"));
                }
                match kind {
                    EntryKind::Begin => LogOperation::Begin,
                    EntryKind::Commit => LogOperation::Commit,
                    _ => LogOperation::Rollback,
                }
            }
            EntryKind::Checkpoint => LogOperation::Checkpoint,
            EntryKind::Write => {
                if owner.transaction().is_none() {
                    return Err(LineError::Malformed("transaction entry owned by SYSTEM"));
                }
                let key = wire.key.ok_or(LineError::Malformed("WRITE missing key"))?;
                let after = wire
                    .after_image
                    .flatten()
                    .ok_or(LineError::Malformed("WRITE missing afterImage"))?;
                LogOperation::Write {
                    key,
                    before: wire.before_image.flatten(),
                    after,
                }
            }
            EntryKind::Delete => {
                if owner.transaction().is_none() {
                    return Err(LineError::Malformed("transaction entry owned by SYSTEM"));
                }
                let key = wire.key.ok_or(LineError::Malformed("DELETE missing key"))?;
                LogOperation::Delete {
                    key,
                    before: wire.before_image.flatten(),
                }
            }
        };

        Ok(Self {
            lsn: Lsn::new(wire.lsn),
            owner,
            op,
            timestamp_ms: wire.timestamp,
        })
    }
}

/// Lowercase hex SHA-256 of `data`.
fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn txn_owner() -> LogOwner {
        LogOwner::Transaction(TransactionId::new())
    }

    fn entry(op: LogOperation) -> LogEntry {
        LogEntry {
            lsn: Lsn::new(7),
            owner: txn_owner(),
            op,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn begin_round_trip() {
        let original = entry(LogOperation::Begin);
        let decoded = LogEntry::from_line(&original.to_line()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn write_round_trip_with_before() {
        let original = entry(LogOperation::Write {
            key: "users".to_string(),
            before: Some(json!({"name": "ada"})),
            after: json!({"name": "ada", "age": 36}),
        });
        let decoded = LogEntry::from_line(&original.to_line()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn write_with_absent_before_serializes_null() {
        let original = entry(LogOperation::Write {
            key: "users".to_string(),
            before: None,
            after: json!({"fresh": true}),
        });
        let line = original.to_line();
        assert!(line.contains("\"beforeImage\":null"));

        let decoded = LogEntry::from_line(&line).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn delete_carries_null_after_image() {
        let original = entry(LogOperation::Delete {
            key: "users".to_string(),
            before: Some(json!({"name": "ada"})),
        });
        let line = original.to_line();
        assert!(line.contains("\"afterImage\":null"));

        let decoded = LogEntry::from_line(&line).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn commit_rollback_round_trip() {
        for op in [LogOperation::Commit, LogOperation::Rollback] {
            let original = entry(op);
            let decoded = LogEntry::from_line(&original.to_line()).unwrap();
            assert_eq!(original, decoded);
        }
    }

    #[test]
    fn checkpoint_is_system_owned() {
        let original = LogEntry {
            lsn: Lsn::new(100),
            owner: LogOwner::System,
            op: LogOperation::Checkpoint,
            timestamp_ms: 0,
        };
        let line = original.to_line();
        assert!(line.contains("\"transactionId\":\"SYSTEM\""));
        assert_eq!(LogEntry::from_line(&line).unwrap(), original);
    }

    #[test]
    fn system_owned_begin_is_malformed() {
        let original = LogEntry {
            lsn: Lsn::new(1),
            owner: LogOwner::System,
            op: LogOperation::Begin,
            timestamp_ms: 0,
        };
        let result = LogEntry::from_line(&original.to_line());
        assert!(matches!(result, Err(LineError::Malformed(_))));
    }

    #[test]
    fn tampered_line_fails_checksum() {
        let original = entry(LogOperation::Write {
            key: "acct".to_string(),
            before: None,
            after: json!({"balance": 1000}),
        });
        let line = original.to_line().replace("1000", "9999");
        assert!(matches!(
            LogEntry::from_line(&line),
            Err(LineError::Checksum { .. })
        ));
    }

    #[test]
    fn truncated_line_is_json_error() {
        let line = entry(LogOperation::Begin).to_line();
        let partial = &line[..line.len() / 2];
        assert!(matches!(
            LogEntry::from_line(partial),
            Err(LineError::Json(_))
        ));
    }

    #[test]
    fn missing_checksum_is_malformed() {
        assert!(matches!(
            LogEntry::from_line(r#"{"lsn":1,"transactionId":"SYSTEM","operation":"CHECKPOINT","timestamp":0}"#),
            Err(LineError::Malformed(_))
        ));
    }

    #[test]
    fn write_without_after_image_is_malformed() {
        // Build a WRITE line, drop the afterImage, re-checksum it so only
        // the structural validation can reject it.
        let original = entry(LogOperation::Write {
            key: "k".to_string(),
            before: None,
            after: json!({}),
        });
        let mut fields = original.wire_fields();
        fields.remove("afterImage");
        let digest = sha256_hex(Value::Object(fields.clone()).to_string().as_bytes());
        fields.insert("checksum".to_string(), Value::String(digest));
        let line = Value::Object(fields).to_string();

        assert!(matches!(
            LogEntry::from_line(&line),
            Err(LineError::Malformed(_))
        ));
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            EntryKind::Begin,
            EntryKind::Write,
            EntryKind::Delete,
            EntryKind::Commit,
            EntryKind::Rollback,
            EntryKind::Checkpoint,
        ] {
            assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntryKind::parse("UPSERT"), None);
    }
}
