//! # Velum Core
//!
//! An embedded, single-node document store mapping string keys to JSON
//! documents, one pretty-printed file per key, with ACID transactions
//! over that file set.
//!
//! This crate provides:
//! - a checksummed, buffered write-ahead log ([`wal::Wal`])
//! - per-key shared/exclusive locking with FIFO queues and
//!   timeout-based deadlock breaking ([`lock::LockManager`])
//! - a transaction registry with a terminal state machine
//!   ([`transaction::TransactionRegistry`])
//! - deep-merge write semantics ([`merge::deep_merge`])
//! - ARIES-style crash recovery (analysis / redo / undo) at open
//!
//! The entry point is [`StorageEngine`]:
//!
//! ```rust,ignore
//! use velum_core::{Config, StorageEngine};
//! use serde_json::json;
//!
//! let engine = StorageEngine::open(Path::new("my_db"))?;
//! let txn = engine.begin_transaction()?;
//! engine.write(txn, "users", json!({"name": "ada"}))?;
//! assert_eq!(engine.read(txn, "users")?, Some(json!({"name": "ada"})));
//! engine.commit(txn)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dir;
pub mod engine;
pub mod error;
pub mod lock;
pub mod merge;
pub mod transaction;
pub mod types;
pub mod wal;

pub use config::Config;
pub use engine::StorageEngine;
pub use error::{EngineError, EngineResult};
pub use merge::deep_merge;
pub use types::{LogOwner, Lsn, TransactionId};
