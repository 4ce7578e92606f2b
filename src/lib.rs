//! RegTech Ingestion - resilient batch ingestion for bank exposure files
//!
//! Uploaded files move through a persisted status machine
//! (UPLOADED → PARSING → VALIDATED → STORING → COMPLETED) with a
//! recovery service that resumes batches left behind by crashes or outages.
//!
//! # Modules
//!
//! - [`ingestion`] - Batch aggregate, circuit breaker, transactions, pipeline, recovery
//! - [`adapters`] - PostgreSQL, HTTP registry, filesystem storage, JSON parsing, events
//! - [`db`] - PostgreSQL pool and schema bootstrap
//! - [`config`] - YAML configuration per environment
//! - [`logging`] - tracing subscriber setup

pub mod adapters;
pub mod config;
pub mod db;
pub mod ingestion;
pub mod logging;

// Convenient re-exports at crate root
pub use ingestion::{
    BankId, BatchId, BatchPipeline, BatchStatus, IngestionBatch, IngestionError, RecoveryService,
    RecoveryWorker, TransactionCoordinator,
};
