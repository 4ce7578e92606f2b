//! Resilient Batch Ingestion
//!
//! Takes regulatory data files submitted by banks from upload to durable
//! storage, surviving crashes, a flaky bank registry and concurrent writers.
//!
//! # Architecture
//!
//! - [`IngestionBatch`]: immutable snapshot aggregate with guarded transitions
//! - [`BankRegistryCircuitBreaker`]: registry calls with cache fallback
//! - [`TransactionCoordinator`]: atomic units of work over a [`TransactionManager`]
//! - [`BatchPipeline`]: drives a batch step by step, checkpointing each step
//! - [`RecoveryService`] / [`RecoveryWorker`]: resume or abort stuck batches
//!
//! # State Machine
//!
//! ```text
//! UPLOADED → PARSING → VALIDATED → STORING → COMPLETED
//!     ↓         ↓          ↓          ↓
//!   FAILED ← ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Guarded transitions**: status only moves along the graph above; the
//!    recovery service may reopen a transiently FAILED batch, within budget
//! 2. **Optimistic concurrency**: a save with a stale version fails with
//!    `ConcurrentModification` and never overwrites
//! 3. **Checkpoint with transition**: each step's checkpoint is written in
//!    the same transaction as its status change
//! 4. **Failures survive rollback**: diagnostic records use an independent
//!    transaction

pub mod batch;
pub mod circuit_breaker;
pub mod error;
pub mod events;
pub mod failure;
pub mod pipeline;
pub mod ports;
pub mod recovery;
pub mod state;
pub mod transaction;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;


// Re-exports for convenience
pub use batch::{BatchRecord, IngestionBatch};
pub use circuit_breaker::{
    BankRegistryCircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use error::{ErrorClass, IngestionError};
pub use events::BatchEvent;
pub use failure::{BatchFailure, FailureCategory};
pub use pipeline::{BatchPipeline, PipelinePorts};
pub use ports::{
    BankInfoCache, BankRegistryClient, BatchRepository, EventPublisher, FailureRecordRepository,
    FileParser, FileValidator, ParsedFile, ProcessingFailureRecord, StorageService,
    ValidationReport,
};
pub use recovery::{
    BulkRecoveryReport, RecoveryConfig, RecoveryService, RecoveryStatus, ResumeAction,
    ResumeOutcome,
};
pub use state::BatchStatus;
pub use transaction::{
    Propagation, TransactionConfig, TransactionCoordinator, TransactionDefinition,
    TransactionHealthStatus, TransactionManager, TxId, current_transaction,
};
pub use types::{BankId, BankInfo, BankStatus, BatchId, FileMetadata, S3Reference};
pub use worker::{RecoveryWorker, WorkerConfig};
