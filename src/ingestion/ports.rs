//! Outbound Ports
//!
//! Collaborators the ingestion core talks to. Implementations live in
//! `crate::adapters`; all of them must be `Send + Sync` because one
//! instance is shared by every batch flow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::batch::IngestionBatch;
use super::error::IngestionError;
use super::events::BatchEvent;
use super::failure::FailureCategory;
use super::state::BatchStatus;
use super::types::{BankId, BankInfo, BatchId, FileMetadata, S3Reference};

/// Remote source of authoritative bank metadata
///
/// May fail or hang arbitrarily. A bank the registry does not know is
/// reported as [`IngestionError::BankNotFound`].
#[async_trait]
pub trait BankRegistryClient: Send + Sync {
    async fn fetch(&self, bank_id: &BankId) -> Result<BankInfo, IngestionError>;
}

/// Last-known bank metadata, keyed by bank id
#[async_trait]
pub trait BankInfoCache: Send + Sync {
    async fn get(&self, bank_id: &BankId) -> Result<Option<BankInfo>, IngestionError>;

    async fn put(&self, info: &BankInfo) -> Result<(), IngestionError>;
}

/// Batch persistence
///
/// Implementations join the ambient transaction of the calling task when
/// there is one (see `crate::ingestion::transaction::current_transaction`).
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn find_by_batch_id(
        &self,
        batch_id: &BatchId,
    ) -> Result<Option<IngestionBatch>, IngestionError>;

    /// Insert a new batch; fails with `DuplicateBatch` if the id is taken
    async fn insert(&self, batch: &IngestionBatch) -> Result<IngestionBatch, IngestionError>;

    /// Replace the stored snapshot.
    ///
    /// The stored version must equal `batch.version`, otherwise
    /// `ConcurrentModification`. Returns the snapshot with its new version.
    async fn save(&self, batch: &IngestionBatch) -> Result<IngestionBatch, IngestionError>;

    /// Batches in one of `statuses` not updated since `cutoff`, oldest first
    async fn find_stuck_batches(
        &self,
        statuses: &[BatchStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IngestionBatch>, IngestionError>;

    async fn count(&self) -> Result<u64, IngestionError>;
}

/// Durable object storage for batch files
#[async_trait]
pub trait StorageService: Send + Sync {
    async fn store_file(
        &self,
        content: &[u8],
        metadata: &FileMetadata,
        batch_id: &BatchId,
        bank_id: &BankId,
        exposure_count: u64,
    ) -> Result<S3Reference, IngestionError>;

    async fn check_health(&self) -> bool;

    /// Remove an object whose recording transaction rolled back
    async fn delete_file(&self, reference: &S3Reference) -> Result<(), IngestionError>;
}

/// Fire-and-observe notifications
///
/// Callers log publish failures; they never fail a batch.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &BatchEvent) -> Result<(), IngestionError>;
}

/// Parsed file content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFile {
    pub exposure_count: usize,
    pub records: Vec<serde_json::Value>,
}

/// Outcome of validating a parsed file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub total_exposures: u64,
    pub warnings: Vec<String>,
}

/// Turns raw file content into records.
///
/// Rejections carry their category (normally `Parse`).
pub trait FileParser: Send + Sync {
    fn parse(&self, content: &[u8], metadata: &FileMetadata)
    -> Result<ParsedFile, IngestionError>;
}

/// Structural validation of parsed records
pub trait FileValidator: Send + Sync {
    fn validate(&self, parsed: &ParsedFile) -> Result<ValidationReport, IngestionError>;
}

/// Diagnostic record of a failed processing step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFailureRecord {
    pub batch_id: BatchId,
    pub bank_id: BankId,
    pub operation: String,
    /// Status the batch was in when the step failed
    pub status: BatchStatus,
    pub category: FailureCategory,
    pub error_code: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl ProcessingFailureRecord {
    pub fn new(
        batch: &IngestionBatch,
        operation: impl Into<String>,
        error: &IngestionError,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            bank_id: batch.bank_id.clone(),
            operation: operation.into(),
            status: batch.status,
            category: error.failure_category(),
            error_code: error.code().to_string(),
            message: error.to_string(),
            occurred_at,
        }
    }
}

/// Failure bookkeeping, written in an independent transaction
#[async_trait]
pub trait FailureRecordRepository: Send + Sync {
    async fn record(&self, record: &ProcessingFailureRecord) -> Result<(), IngestionError>;

    async fn find_for_batch(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<ProcessingFailureRecord>, IngestionError>;
}
