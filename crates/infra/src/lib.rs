//! `stockflow-infra` — the inventory engine and its storage adapters.
//!
//! [`InventoryEngine`] owns a store and the engine configuration, and hands
//! out the per-concern services: ledger, sequences, transfers, corrections
//! and reconciliation. Storage is behind [`store::InventoryStore`], with an
//! in-memory implementation for tests and a PostgreSQL one for production.

pub mod capabilities;
pub mod config;
pub mod correction;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod reconciliation;
pub mod retry;
pub mod sequence;
pub mod store;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use config::{BusinessPolicy, EngineConfig, SequenceConfig};
pub use correction::{CorrectionApproval, CorrectionWorkflow};
pub use engine::InventoryEngine;
pub use error::{EngineError, EngineResult, ErrorKind, StoreError};
pub use ledger::{LedgerHistory, LedgerService};
pub use notify::NotificationSink;
pub use reconciliation::{BusinessAudit, ConsistencyReport, Reconciliation};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use sequence::SequenceGenerator;
pub use store::{
    InMemoryInventoryStore, InventoryStore, PostgresInventoryStore, PostgresStoreOptions,
    UnitOfWork,
};
pub use transfer::{TransferOutcome, TransferWorkflow};
