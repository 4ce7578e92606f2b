//! Ingestion Batch Aggregate
//!
//! An [`IngestionBatch`] is an immutable snapshot. Every transition takes
//! `&self` and returns a new snapshot (plus the domain event it emits), so
//! concurrent handlers can only publish their result by replacing the
//! stored snapshot under the repository's version check.

use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::IngestionError;
use super::events::BatchEvent;
use super::failure::BatchFailure;
use super::state::BatchStatus;
use super::types::{BankId, BankInfo, BatchId, FileMetadata, S3Reference};

/// Plain data form of a batch, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub bank_id: BankId,
    pub status: BatchStatus,
    pub file_metadata: FileMetadata,
    pub s3_reference: Option<S3Reference>,
    pub bank_info: Option<BankInfo>,
    pub total_exposures: Option<u64>,
    pub uploaded_at: DateTime<Utc>,
    /// Last time anything about the batch changed
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<BatchFailure>,
    pub processing_duration_ms: Option<i64>,
    pub recovery_attempts: u32,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub checkpoint_data: Option<String>,
    /// Optimistic concurrency version, bumped by every successful save
    pub version: u64,
}

/// Ingestion batch snapshot
///
/// Read access goes through [`Deref`] to [`BatchRecord`]; changes only
/// through the guarded transition functions below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngestionBatch(BatchRecord);

impl Deref for IngestionBatch {
    type Target = BatchRecord;

    fn deref(&self) -> &BatchRecord {
        &self.0
    }
}

impl IngestionBatch {
    /// Create a new batch in UPLOADED state
    pub fn new(
        batch_id: BatchId,
        bank_id: BankId,
        file_metadata: FileMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self(BatchRecord {
            batch_id,
            bank_id,
            status: BatchStatus::Uploaded,
            file_metadata,
            s3_reference: None,
            bank_info: None,
            total_exposures: None,
            uploaded_at: now,
            updated_at: now,
            completed_at: None,
            failure: None,
            processing_duration_ms: None,
            recovery_attempts: 0,
            last_checkpoint: None,
            checkpoint_data: None,
            version: 0,
        })
    }

    /// Reconstitute from persistence
    pub fn from_record(record: BatchRecord) -> Self {
        Self(record)
    }

    pub fn record(&self) -> &BatchRecord {
        &self.0
    }

    pub fn into_record(self) -> BatchRecord {
        self.0
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0.failure.as_ref().map(|f| f.message.as_str())
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.0.status.is_terminal()
    }

    /// Copy of this snapshot with a new version (used by repositories)
    pub fn with_version(&self, version: u64) -> Self {
        let mut record = self.0.clone();
        record.version = version;
        Self(record)
    }

    /// Check a forward transition and return a touched copy in the new status
    fn advance(&self, to: BatchStatus, now: DateTime<Utc>) -> Result<BatchRecord, IngestionError> {
        if !self.0.status.can_transition_to(to) {
            return Err(IngestionError::InvalidStateTransition {
                from: self.0.status,
                to,
            });
        }
        let mut next = self.0.clone();
        next.status = to;
        next.updated_at = now;
        Ok(next)
    }

    fn ensure_not_terminal(&self) -> Result<(), IngestionError> {
        if self.is_terminal() {
            return Err(IngestionError::InvalidStateTransition {
                from: self.0.status,
                to: self.0.status,
            });
        }
        Ok(())
    }

    fn duration_ms(&self, completed_at: DateTime<Utc>) -> i64 {
        (completed_at - self.0.uploaded_at).num_milliseconds()
    }

    // ========================================================================
    // Forward transitions
    // ========================================================================

    /// UPLOADED -> PARSING
    pub fn start_processing(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Self, BatchEvent), IngestionError> {
        let next = self.advance(BatchStatus::Parsing, now)?;
        let event = BatchEvent::ProcessingStarted {
            batch_id: next.batch_id.clone(),
            bank_id: next.bank_id.clone(),
            at: now,
        };
        Ok((Self(next), event))
    }

    /// PARSING -> VALIDATED, recording the exposure count
    pub fn mark_as_validated(
        &self,
        exposure_count: i64,
        now: DateTime<Utc>,
    ) -> Result<(Self, BatchEvent), IngestionError> {
        if exposure_count < 0 {
            return Err(IngestionError::NegativeExposureCount(exposure_count));
        }
        let exposure_count = exposure_count as u64;

        let mut next = self.advance(BatchStatus::Validated, now)?;
        next.total_exposures = Some(exposure_count);
        let event = BatchEvent::Validated {
            batch_id: next.batch_id.clone(),
            bank_id: next.bank_id.clone(),
            exposure_count,
            at: now,
        };
        Ok((Self(next), event))
    }

    /// Attach enrichment data; status is unchanged
    pub fn attach_bank_info(
        &self,
        info: BankInfo,
        now: DateTime<Utc>,
    ) -> Result<Self, IngestionError> {
        self.ensure_not_terminal()?;
        if info.bank_id != self.0.bank_id {
            return Err(IngestionError::BankIdMismatch {
                expected: self.0.bank_id.clone(),
                actual: info.bank_id,
            });
        }
        if !info.is_active() {
            return Err(IngestionError::BankInactive(info.bank_id));
        }

        let mut next = self.0.clone();
        next.bank_info = Some(info);
        next.updated_at = now;
        Ok(Self(next))
    }

    /// VALIDATED -> STORING with the storage reference.
    ///
    /// A batch recovery already moved to STORING without a reference gets
    /// the reference attached in place.
    pub fn record_s3_storage(
        &self,
        reference: S3Reference,
        now: DateTime<Utc>,
    ) -> Result<(Self, BatchEvent), IngestionError> {
        let mut next = match (self.0.status, &self.0.s3_reference) {
            (BatchStatus::Storing, None) => {
                let mut next = self.0.clone();
                next.updated_at = now;
                next
            }
            _ => self.advance(BatchStatus::Storing, now)?,
        };
        next.s3_reference = Some(reference.clone());
        let event = BatchEvent::Stored {
            batch_id: next.batch_id.clone(),
            bank_id: next.bank_id.clone(),
            s3_reference: reference,
            at: now,
        };
        Ok((Self(next), event))
    }

    /// VALIDATED -> STORING before any reference exists, so storage is
    /// re-attempted by the next pipeline run
    pub fn start_storage(&self, now: DateTime<Utc>) -> Result<Self, IngestionError> {
        let mut next = self.advance(BatchStatus::Storing, now)?;
        next.failure = None;
        Ok(Self(next))
    }

    /// STORING -> COMPLETED; needs both the reference and the exposure count
    pub fn complete_ingestion(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Self, BatchEvent), IngestionError> {
        let mut next = self.advance(BatchStatus::Completed, now)?;
        let s3_reference = next
            .s3_reference
            .clone()
            .ok_or(IngestionError::MissingS3Reference)?;
        let exposure_count = next
            .total_exposures
            .ok_or(IngestionError::MissingExposureCount)?;

        next.completed_at = Some(now);
        next.processing_duration_ms = Some(self.duration_ms(now));
        let event = BatchEvent::Completed {
            batch_id: next.batch_id.clone(),
            bank_id: next.bank_id.clone(),
            s3_reference,
            exposure_count,
            file_size_bytes: next.file_metadata.file_size_bytes,
            at: now,
        };
        Ok((Self(next), event))
    }

    /// Any non-terminal state -> FAILED. No positive event is emitted.
    pub fn mark_as_failed(
        &self,
        failure: BatchFailure,
        now: DateTime<Utc>,
    ) -> Result<Self, IngestionError> {
        let mut next = self.advance(BatchStatus::Failed, now)?;
        next.failure = Some(failure);
        next.completed_at = Some(now);
        next.processing_duration_ms = Some(self.duration_ms(now));
        Ok(Self(next))
    }

    // ========================================================================
    // Checkpoint and recovery operations
    // ========================================================================

    /// Stamp a resume point at the current status
    pub fn record_checkpoint(
        &self,
        status: BatchStatus,
        data: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, IngestionError> {
        self.ensure_not_terminal()?;
        if status != self.0.status {
            return Err(IngestionError::CheckpointStatusMismatch {
                requested: status,
                actual: self.0.status,
            });
        }

        let mut next = self.0.clone();
        next.last_checkpoint = Some(now);
        if let Some(data) = data.filter(|d| !d.trim().is_empty()) {
            next.checkpoint_data = Some(data);
        }
        next.updated_at = now;
        Ok(Self(next))
    }

    /// Clear any recorded failure and stay in the current step so it is retried
    pub fn retry_current_step(&self, now: DateTime<Utc>) -> Result<Self, IngestionError> {
        self.ensure_not_terminal()?;
        let mut next = self.0.clone();
        next.failure = None;
        next.updated_at = now;
        Ok(Self(next))
    }

    /// [`Self::retry_current_step`] for a stuck batch, consuming one recovery attempt
    pub fn retry_stuck_step(&self, now: DateTime<Utc>) -> Result<Self, IngestionError> {
        let mut next = self.retry_current_step(now)?;
        next.0.recovery_attempts += 1;
        Ok(next)
    }

    /// Furthest status whose artifacts are already present
    pub fn furthest_resume_point(&self) -> BatchStatus {
        if self.0.s3_reference.is_some() {
            BatchStatus::Storing
        } else if self.0.bank_info.is_some() {
            BatchStatus::Validated
        } else if self.0.total_exposures.is_some_and(|n| n > 0) {
            BatchStatus::Validated
        } else {
            BatchStatus::Uploaded
        }
    }

    /// FAILED -> `target`, consuming one recovery attempt.
    ///
    /// This is the only way out of FAILED and is reserved for the recovery
    /// service; the attempt budget is enforced by the caller.
    pub fn reopen_for_recovery(
        &self,
        target: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<Self, IngestionError> {
        let reopenable = matches!(
            target,
            BatchStatus::Uploaded | BatchStatus::Validated | BatchStatus::Storing
        );
        if self.0.status != BatchStatus::Failed || !reopenable {
            return Err(IngestionError::InvalidStateTransition {
                from: self.0.status,
                to: target,
            });
        }

        let mut next = self.0.clone();
        next.status = target;
        next.recovery_attempts += 1;
        next.failure = None;
        next.completed_at = None;
        next.processing_duration_ms = None;
        next.updated_at = now;
        Ok(Self(next))
    }
}
