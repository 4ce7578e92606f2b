//! Recovery Service
//!
//! Finds batches stuck in a non-terminal status and resumes them from the
//! furthest point whose artifacts are already durable. FAILED batches are
//! reopened only when their failure category is transient, and never more
//! than `max_recovery_attempts` times.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::batch::IngestionBatch;
use super::error::IngestionError;
use super::failure::{BatchFailure, FailureCategory};
use super::ports::{BatchRepository, EventPublisher};
use super::state::BatchStatus;
use super::transaction::TransactionCoordinator;
use super::types::BatchId;

/// `recovery` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RecoveryConfig {
    pub stuck_batch_timeout_minutes: i64,
    pub max_recovery_attempts: u32,
    /// Also the period of the background recovery pass
    pub checkpoint_interval_minutes: u64,
    /// Maximum batches resumed per pass
    pub scan_batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stuck_batch_timeout_minutes: 30,
            max_recovery_attempts: 3,
            checkpoint_interval_minutes: 5,
            scan_batch_size: 100,
        }
    }
}

/// What a resume did to the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    /// UPLOADED -> PARSING
    RestartedParsing,
    /// PARSING kept, failure cleared
    RetriedParsing,
    /// PARSING -> VALIDATED, count was already recorded
    AdvancedToValidated,
    /// VALIDATED -> STORING
    AdvancedToStoring,
    /// STORING kept, failure cleared
    RetriedStorage,
    /// STORING -> COMPLETED, the file was already stored
    Completed,
    /// Nothing to do
    AlreadyCompleted,
    /// FAILED -> the given status
    Reopened(BatchStatus),
}

#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub batch: IngestionBatch,
    pub action: ResumeAction,
}

#[derive(Debug, Clone)]
pub struct BatchRecoveryError {
    pub batch_id: BatchId,
    pub error: IngestionError,
}

/// Result of one bulk recovery pass. Partial success is normal.
#[derive(Debug, Clone, Default)]
pub struct BulkRecoveryReport {
    pub scanned: usize,
    pub recovered: Vec<BatchId>,
    pub errors: Vec<BatchRecoveryError>,
}

impl BulkRecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Derived recovery view of one batch
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub is_stuck: bool,
    pub is_recoverable: bool,
    pub recovery_attempts: u32,
    pub max_recovery_attempts: u32,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_category: Option<FailureCategory>,
    pub recommendations: Vec<String>,
}

impl RecoveryStatus {
    pub fn can_attempt_recovery(&self) -> bool {
        self.is_recoverable && self.recovery_attempts < self.max_recovery_attempts
    }

    pub fn needs_manual_intervention(&self) -> bool {
        !self.is_recoverable || self.recovery_attempts >= self.max_recovery_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_recovery_attempts
            .saturating_sub(self.recovery_attempts)
    }
}

/// Resume errors that no later pass can fix: the retry budget is spent or a
/// step's artifact is missing
fn gives_up_on_stuck_batch(error: &IngestionError) -> bool {
    matches!(
        error,
        IngestionError::MaxRecoveryAttemptsExceeded { .. }
            | IngestionError::MissingExposureCount
            | IngestionError::MissingS3Reference
    )
}

/// Failure recorded on a FAILED batch; untagged legacy messages are classified
fn recorded_failure(batch: &IngestionBatch) -> BatchFailure {
    batch
        .failure
        .clone()
        .unwrap_or_else(|| BatchFailure::new(FailureCategory::Unknown, "Unknown error"))
}

pub struct RecoveryService {
    batches: Arc<dyn BatchRepository>,
    transactions: Arc<TransactionCoordinator>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl RecoveryService {
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        transactions: Arc<TransactionCoordinator>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            batches,
            transactions,
            publisher,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn stuck_timeout(&self) -> Duration {
        Duration::minutes(self.config.stuck_batch_timeout_minutes)
    }

    /// Non-terminal and not updated for longer than the stuck timeout
    pub fn is_stuck_batch(&self, batch: &IngestionBatch) -> bool {
        !batch.is_terminal() && self.clock.utc() - batch.updated_at > self.stuck_timeout()
    }

    /// Status a FAILED batch may be reopened to, or why it may not
    fn reopen_target(&self, batch: &IngestionBatch) -> Result<BatchStatus, IngestionError> {
        let failure = recorded_failure(batch);
        if !failure.is_recoverable() {
            warn!(
                batch_id = %batch.batch_id,
                category = %failure.category,
                "Batch failure is not recoverable"
            );
            return Err(IngestionError::NonRecoverableFailure {
                batch_id: batch.batch_id.clone(),
                message: failure.message,
            });
        }
        self.ensure_attempts_left(batch)?;
        Ok(batch.furthest_resume_point())
    }

    fn ensure_attempts_left(&self, batch: &IngestionBatch) -> Result<(), IngestionError> {
        if batch.recovery_attempts >= self.config.max_recovery_attempts {
            error!(
                batch_id = %batch.batch_id,
                attempts = batch.recovery_attempts,
                max = self.config.max_recovery_attempts,
                "Maximum recovery attempts exceeded"
            );
            return Err(IngestionError::MaxRecoveryAttemptsExceeded {
                batch_id: batch.batch_id.clone(),
                attempts: batch.recovery_attempts,
            });
        }
        Ok(())
    }

    /// Resume one batch according to its current status
    pub async fn resume_processing_from_checkpoint(
        &self,
        batch_id: &BatchId,
    ) -> Result<ResumeOutcome, IngestionError> {
        let name = format!("resume-{}", batch_id);
        let (outcome, event) = self
            .transactions
            .execute_in_transaction(&name, async {
                let batch = self
                    .batches
                    .find_by_batch_id(batch_id)
                    .await?
                    .ok_or_else(|| IngestionError::BatchNotFound(batch_id.clone()))?;
                let now = self.clock.utc();
                debug!(batch_id = %batch_id, status = %batch.status, "Resuming batch");

                let (next, action, event) = match batch.status {
                    BatchStatus::Uploaded => {
                        let (next, event) = batch.retry_current_step(now)?.start_processing(now)?;
                        (next, ResumeAction::RestartedParsing, Some(event))
                    }
                    BatchStatus::Parsing => match batch.total_exposures {
                        Some(count) => {
                            let (next, event) = batch
                                .retry_current_step(now)?
                                .mark_as_validated(count as i64, now)?;
                            (next, ResumeAction::AdvancedToValidated, Some(event))
                        }
                        None => {
                            self.ensure_attempts_left(&batch)?;
                            (
                                batch.retry_stuck_step(now)?,
                                ResumeAction::RetriedParsing,
                                None,
                            )
                        }
                    },
                    BatchStatus::Validated => (
                        batch.retry_current_step(now)?.start_storage(now)?,
                        ResumeAction::AdvancedToStoring,
                        None,
                    ),
                    BatchStatus::Storing if batch.s3_reference.is_some() => {
                        let (next, event) = batch.retry_current_step(now)?.complete_ingestion(now)?;
                        (next, ResumeAction::Completed, Some(event))
                    }
                    BatchStatus::Storing => {
                        self.ensure_attempts_left(&batch)?;
                        (
                            batch.retry_stuck_step(now)?,
                            ResumeAction::RetriedStorage,
                            None,
                        )
                    }
                    BatchStatus::Completed => {
                        return Ok((
                            ResumeOutcome {
                                batch,
                                action: ResumeAction::AlreadyCompleted,
                            },
                            None,
                        ));
                    }
                    BatchStatus::Failed => {
                        let target = self.reopen_target(&batch)?;
                        (
                            batch.reopen_for_recovery(target, now)?,
                            ResumeAction::Reopened(target),
                            None,
                        )
                    }
                };

                let batch = self.batches.save(&next).await?;
                Ok((ResumeOutcome { batch, action }, event))
            })
            .await?;

        if let Some(event) = event
            && let Err(e) = self.publisher.publish(&event).await
        {
            warn!(batch_id = %batch_id, event = event.name(), error = %e, "Failed to publish event");
        }
        info!(
            batch_id = %batch_id,
            status = %outcome.batch.status,
            action = ?outcome.action,
            recovery_attempts = outcome.batch.recovery_attempts,
            "Batch resumed"
        );
        Ok(outcome)
    }

    /// Resume every stuck in-flight batch, each independently
    pub async fn recover_stuck_batches(&self) -> Result<BulkRecoveryReport, IngestionError> {
        let cutoff = self.clock.utc() - self.stuck_timeout();
        let stuck = self
            .batches
            .find_stuck_batches(&BatchStatus::IN_FLIGHT, cutoff, self.config.scan_batch_size)
            .await?;

        let mut report = BulkRecoveryReport {
            scanned: stuck.len(),
            ..BulkRecoveryReport::default()
        };
        if stuck.is_empty() {
            debug!("No stuck batches found");
            return Ok(report);
        }
        info!(count = stuck.len(), "Found stuck batches for recovery");

        for batch in stuck {
            info!(
                batch_id = %batch.batch_id,
                status = %batch.status,
                updated_at = %batch.updated_at,
                "Recovering stuck batch"
            );
            let batch_id = batch.batch_id.clone();
            match self.resume_processing_from_checkpoint(&batch_id).await {
                Ok(_) => report.recovered.push(batch_id),
                Err(e) => {
                    error!(batch_id = %batch_id, error = %e, "Failed to recover stuck batch");
                    if gives_up_on_stuck_batch(&e) {
                        self.fail_stuck_batch(&batch_id, &e).await;
                    }
                    report.errors.push(BatchRecoveryError { batch_id, error: e });
                }
            }
        }

        info!(
            scanned = report.scanned,
            recovered = report.recovered.len(),
            failed = report.errors.len(),
            "Stuck batch recovery pass finished"
        );
        Ok(report)
    }

    /// Take a stuck batch out of the in-flight set for manual handling
    async fn fail_stuck_batch(&self, batch_id: &BatchId, cause: &IngestionError) {
        match self.transactions.mark_batch_failed(batch_id, cause).await {
            Ok(Some(_)) => warn!(
                batch_id = %batch_id,
                code = cause.code(),
                "Stuck batch marked FAILED"
            ),
            Ok(None) => {}
            Err(e) => error!(batch_id = %batch_id, error = %e, "Failed to mark stuck batch FAILED"),
        }
    }

    /// Stamp a resume point; `status` must be the batch's current status
    pub async fn create_recovery_checkpoint(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
        data: Option<String>,
    ) -> Result<IngestionBatch, IngestionError> {
        let name = format!("checkpoint-{}", batch_id);
        self.transactions
            .execute_in_transaction(&name, async {
                let batch = self
                    .batches
                    .find_by_batch_id(batch_id)
                    .await?
                    .ok_or_else(|| IngestionError::BatchNotFound(batch_id.clone()))?;
                let stamped = batch.record_checkpoint(status, data, self.clock.utc())?;
                let saved = self.batches.save(&stamped).await?;
                debug!(batch_id = %batch_id, status = %status, "Recovery checkpoint created");
                Ok(saved)
            })
            .await
    }

    pub async fn get_recovery_status(
        &self,
        batch_id: &BatchId,
    ) -> Result<RecoveryStatus, IngestionError> {
        let batch = self
            .batches
            .find_by_batch_id(batch_id)
            .await?
            .ok_or_else(|| IngestionError::BatchNotFound(batch_id.clone()))?;
        Ok(self.recovery_status(&batch))
    }

    /// Recovery view of an already loaded batch
    pub fn recovery_status(&self, batch: &IngestionBatch) -> RecoveryStatus {
        let is_stuck = self.is_stuck_batch(batch);
        let is_recoverable = match batch.status {
            BatchStatus::Failed => recorded_failure(batch).is_recoverable(),
            _ => true,
        };

        RecoveryStatus {
            batch_id: batch.batch_id.clone(),
            status: batch.status,
            is_stuck,
            is_recoverable,
            recovery_attempts: batch.recovery_attempts,
            max_recovery_attempts: self.config.max_recovery_attempts,
            last_checkpoint: batch.last_checkpoint,
            error_message: batch.error_message().map(str::to_string),
            failure_category: batch.failure.as_ref().map(|f| f.category),
            recommendations: self.recommendations(batch, is_stuck, is_recoverable),
        }
    }

    fn recommendations(
        &self,
        batch: &IngestionBatch,
        is_stuck: bool,
        is_recoverable: bool,
    ) -> Vec<String> {
        let mut recommendations = Vec::new();
        if is_stuck {
            recommendations.push("Batch appears to be stuck - consider manual recovery".to_string());
            recommendations.push("Check system logs for processing errors".to_string());
        }
        if batch.status == BatchStatus::Failed {
            if is_recoverable {
                recommendations.push("Failure appears recoverable - retry processing".to_string());
                recommendations.push("Check external service availability".to_string());
            } else {
                recommendations
                    .push("Failure is not recoverable - manual intervention required".to_string());
                recommendations.push("Review and correct input data".to_string());
            }
        }
        if batch.recovery_attempts > 0 {
            recommendations.push(format!(
                "Recovery has been attempted {} times",
                batch.recovery_attempts
            ));
            if batch.recovery_attempts >= self.config.max_recovery_attempts {
                recommendations.push(
                    "Maximum recovery attempts reached - manual intervention required".to_string(),
                );
            }
        }
        recommendations
    }
}
