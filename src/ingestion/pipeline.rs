//! Batch Pipeline
//!
//! Drives one batch through its steps, each in its own transaction:
//!
//! ```text
//! UPLOADED  --start-->    PARSING
//! PARSING   --parse-->    VALIDATED        (exposure count recorded)
//! VALIDATED --enrich-->   VALIDATED        (bank info attached)
//! VALIDATED --store-->    STORING          (storage reference recorded)
//! STORING   --complete--> COMPLETED
//! ```
//!
//! Every step saves its transition together with a checkpoint, so a crash
//! between steps leaves the batch at a precise resume point. `process` is
//! resume-aware: it dispatches on whatever status the batch is in.
//!
//! A failing step's transaction rolls back and the batch is marked FAILED
//! (see `TransactionCoordinator::execute_batch_processing_transaction`); a
//! processing-failure record is then written in an independent transaction.

use std::future::Future;
use std::sync::Arc;

use mockable::Clock;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::batch::IngestionBatch;
use super::circuit_breaker::BankRegistryCircuitBreaker;
use super::error::IngestionError;
use super::events::BatchEvent;
use super::ports::{
    BatchRepository, EventPublisher, FailureRecordRepository, FileParser, FileValidator,
    ProcessingFailureRecord, StorageService,
};
use super::state::BatchStatus;
use super::transaction::TransactionCoordinator;
use super::types::{BankId, BatchId, FileMetadata, S3Reference};

/// Upper bound on steps per `process` call
const MAX_STEPS: usize = 10;

/// Collaborators of the pipeline
#[derive(Clone)]
pub struct PipelinePorts {
    pub batches: Arc<dyn BatchRepository>,
    pub transactions: Arc<TransactionCoordinator>,
    pub bank_registry: Arc<BankRegistryCircuitBreaker>,
    pub storage: Arc<dyn StorageService>,
    pub parser: Arc<dyn FileParser>,
    pub validator: Arc<dyn FileValidator>,
    pub failures: Arc<dyn FailureRecordRepository>,
    pub publisher: Arc<dyn EventPublisher>,
}

/// Next unit of work for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    Parse,
    Enrich,
    Store,
    Complete,
}

impl Step {
    fn for_batch(batch: &IngestionBatch) -> Option<Step> {
        match batch.status {
            BatchStatus::Uploaded => Some(Step::Start),
            BatchStatus::Parsing => Some(Step::Parse),
            BatchStatus::Validated | BatchStatus::Storing
                if batch.s3_reference.is_none() && batch.bank_info.is_none() =>
            {
                Some(Step::Enrich)
            }
            BatchStatus::Validated | BatchStatus::Storing if batch.s3_reference.is_none() => {
                Some(Step::Store)
            }
            BatchStatus::Storing => Some(Step::Complete),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Step::Start => "start-processing",
            Step::Parse => "parse-and-validate",
            Step::Enrich => "enrich-bank-info",
            Step::Store => "store-file",
            Step::Complete => "complete-ingestion",
        }
    }
}

pub struct BatchPipeline {
    ports: PipelinePorts,
    clock: Arc<dyn Clock>,
}

impl BatchPipeline {
    pub fn new(ports: PipelinePorts, clock: Arc<dyn Clock>) -> Self {
        Self { ports, clock }
    }

    /// Register an uploaded file as a new UPLOADED batch
    pub async fn upload(
        &self,
        bank_id: BankId,
        metadata: FileMetadata,
        batch_id: Option<BatchId>,
    ) -> Result<IngestionBatch, IngestionError> {
        let batch_id = batch_id.unwrap_or_else(BatchId::generate);
        let batch = IngestionBatch::new(batch_id.clone(), bank_id, metadata, self.clock.utc());
        let name = format!("upload-{}", batch_id);

        let saved = self
            .ports
            .transactions
            .execute_in_transaction(&name, self.ports.batches.insert(&batch))
            .await?;
        info!(
            batch_id = %saved.batch_id,
            bank_id = %saved.bank_id,
            file = %saved.file_metadata.file_name,
            size = saved.file_metadata.file_size_bytes,
            "Batch uploaded"
        );
        Ok(saved)
    }

    pub async fn get_batch(&self, batch_id: &BatchId) -> Result<IngestionBatch, IngestionError> {
        self.ports
            .batches
            .find_by_batch_id(batch_id)
            .await?
            .ok_or_else(|| IngestionError::BatchNotFound(batch_id.clone()))
    }

    /// Drive the batch to a terminal status.
    ///
    /// Returns the COMPLETED batch, or the error that failed it.
    pub async fn process(
        &self,
        batch_id: &BatchId,
        content: &[u8],
    ) -> Result<IngestionBatch, IngestionError> {
        for _ in 0..MAX_STEPS {
            let batch = self.get_batch(batch_id).await?;
            let Some(step) = Step::for_batch(&batch) else {
                return match batch.status {
                    BatchStatus::Completed => Ok(batch),
                    status => Err(IngestionError::InvalidStateTransition {
                        from: status,
                        to: BatchStatus::Parsing,
                    }),
                };
            };
            debug!(batch_id = %batch_id, status = %batch.status, step = step.name(), "Running step");
            self.run_step(&batch, step, content).await?;
        }

        Err(IngestionError::Internal(format!(
            "batch {} did not finish within {} steps",
            batch_id, MAX_STEPS
        )))
    }

    /// Run one step against the loaded `batch`.
    ///
    /// A failure is recorded after the step's transaction has rolled back,
    /// so the record survives timeouts and panics inside the step.
    async fn run_step(
        &self,
        batch: &IngestionBatch,
        step: Step,
        content: &[u8],
    ) -> Result<(), IngestionError> {
        let batch_id = &batch.batch_id;
        let result = match step {
            Step::Start => self.in_step(batch_id, |b| self.start(b)).await,
            Step::Parse => {
                self.in_step(batch_id, |b| self.parse_and_validate(b, content))
                    .await
            }
            Step::Enrich => self.in_step(batch_id, |b| self.enrich(b)).await,
            Step::Store => {
                self.in_step(batch_id, |b| self.store(b, content))
                    .await
            }
            Step::Complete => self.in_step(batch_id, |b| self.complete(b)).await,
        };

        match result {
            Ok(events) => {
                for event in &events {
                    self.publish(event).await;
                }
                Ok(())
            }
            Err(e) => {
                error!(batch_id = %batch_id, step = step.name(), error = %e, "Step failed");
                if !matches!(e, IngestionError::BatchNotFound(_)) {
                    self.record_failure(batch, step, &e).await;
                }
                self.publish_failure(batch_id, &e).await;
                Err(e)
            }
        }
    }

    /// Run `op` in a batch-processing transaction
    async fn in_step<F, Fut>(
        &self,
        batch_id: &BatchId,
        op: F,
    ) -> Result<Vec<BatchEvent>, IngestionError>
    where
        F: FnOnce(IngestionBatch) -> Fut + Send,
        Fut: Future<Output = Result<Vec<BatchEvent>, IngestionError>> + Send,
    {
        self.ports
            .transactions
            .execute_batch_processing_transaction(batch_id, op)
            .await
    }

    /// Save a transitioned snapshot stamped with a checkpoint
    async fn save_with_checkpoint(
        &self,
        batch: &IngestionBatch,
        step: Step,
        data: serde_json::Value,
    ) -> Result<IngestionBatch, IngestionError> {
        let stamped = batch.record_checkpoint(
            batch.status,
            Some(json!({ "step": step.name(), "data": data }).to_string()),
            self.clock.utc(),
        )?;
        self.ports.batches.save(&stamped).await
    }

    async fn start(&self, batch: IngestionBatch) -> Result<Vec<BatchEvent>, IngestionError> {
        let (next, event) = batch.start_processing(self.clock.utc())?;
        self.save_with_checkpoint(&next, Step::Start, json!({}))
            .await?;
        Ok(vec![event])
    }

    async fn parse_and_validate(
        &self,
        batch: IngestionBatch,
        content: &[u8],
    ) -> Result<Vec<BatchEvent>, IngestionError> {
        let parsed = self.ports.parser.parse(content, &batch.file_metadata)?;
        let report = self.ports.validator.validate(&parsed)?;
        for warning in &report.warnings {
            warn!(batch_id = %batch.batch_id, warning = %warning, "Validation warning");
        }

        let total = i64::try_from(report.total_exposures).map_err(|_| {
            IngestionError::Internal(format!(
                "exposure count {} out of range",
                report.total_exposures
            ))
        })?;
        let (next, event) = batch.mark_as_validated(total, self.clock.utc())?;
        self.save_with_checkpoint(
            &next,
            Step::Parse,
            json!({ "total_exposures": report.total_exposures }),
        )
        .await?;
        Ok(vec![event])
    }

    async fn enrich(&self, batch: IngestionBatch) -> Result<Vec<BatchEvent>, IngestionError> {
        let info = self.ports.bank_registry.get_bank_info(&batch.bank_id).await?;
        let next = batch.attach_bank_info(info, self.clock.utc())?;
        self.save_with_checkpoint(
            &next,
            Step::Enrich,
            json!({ "bank_id": next.bank_id.as_str() }),
        )
        .await?;
        Ok(Vec::new())
    }

    async fn store(
        &self,
        batch: IngestionBatch,
        content: &[u8],
    ) -> Result<Vec<BatchEvent>, IngestionError> {
        let exposures = batch
            .total_exposures
            .ok_or(IngestionError::MissingExposureCount)?;
        let reference = self
            .ports
            .storage
            .store_file(
                content,
                &batch.file_metadata,
                &batch.batch_id,
                &batch.bank_id,
                exposures,
            )
            .await?;

        let recorded = async {
            let (next, event) = batch.record_s3_storage(reference.clone(), self.clock.utc())?;
            self.save_with_checkpoint(&next, Step::Store, json!({ "uri": reference.uri }))
                .await?;
            Ok::<_, IngestionError>(vec![event])
        }
        .await;
        if recorded.is_err() {
            self.discard_stored_file(&batch.batch_id, &reference).await;
        }
        recorded
    }

    async fn complete(&self, batch: IngestionBatch) -> Result<Vec<BatchEvent>, IngestionError> {
        let (next, event) = batch.complete_ingestion(self.clock.utc())?;
        let saved = self.ports.batches.save(&next).await?;
        info!(
            batch_id = %saved.batch_id,
            bank_id = %saved.bank_id,
            exposures = ?saved.total_exposures,
            duration_ms = ?saved.processing_duration_ms,
            "Batch ingestion completed"
        );
        Ok(vec![event])
    }

    async fn discard_stored_file(&self, batch_id: &BatchId, reference: &S3Reference) {
        match self.ports.storage.delete_file(reference).await {
            Ok(()) => info!(batch_id = %batch_id, uri = %reference.uri, "Discarded stored file"),
            Err(e) => warn!(
                batch_id = %batch_id,
                uri = %reference.uri,
                error = %e,
                "Failed to discard stored file"
            ),
        }
    }

    async fn record_failure(&self, batch: &IngestionBatch, step: Step, cause: &IngestionError) {
        let record = ProcessingFailureRecord::new(batch, step.name(), cause, self.clock.utc());
        let written = self
            .ports
            .transactions
            .execute_in_new_transaction(
                "record-processing-failure",
                self.ports.failures.record(&record),
            )
            .await;
        if let Err(e) = written {
            error!(batch_id = %batch.batch_id, error = %e, "Failed to record processing failure");
        }
    }

    async fn publish(&self, event: &BatchEvent) {
        if let Err(e) = self.ports.publisher.publish(event).await {
            warn!(batch_id = %event.batch_id(), event = event.name(), error = %e, "Failed to publish event");
        }
    }

    async fn publish_failure(&self, batch_id: &BatchId, cause: &IngestionError) {
        let batch = match self.ports.batches.find_by_batch_id(batch_id).await {
            Ok(Some(batch)) if batch.status == BatchStatus::Failed => batch,
            Ok(_) => return,
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Could not reload failed batch");
                return;
            }
        };
        let event = BatchEvent::Failed {
            batch_id: batch.batch_id.clone(),
            bank_id: batch.bank_id.clone(),
            category: cause.failure_category(),
            message: cause.to_string(),
            at: self.clock.utc(),
        };
        self.publish(&event).await;
    }
}
