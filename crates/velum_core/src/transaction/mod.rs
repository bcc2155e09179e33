//! Transaction state and registry.

mod registry;
mod state;

pub use registry::TransactionRegistry;
pub use state::{Operation, OperationKind, TransactionRecord, TransactionStatus};
