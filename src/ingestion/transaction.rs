//! Transaction Coordinator
//!
//! Runs units of work atomically: begin, run, commit on `Ok`, roll back on
//! `Err`, timeout or panic.
//!
//! The active transaction is carried in a tokio task-local, so
//! repositories called from inside a unit of work join it without any
//! handle being threaded through. `Propagation::RequiresNew` shadows the
//! ambient transaction for the duration of the inner unit, which is how
//! failure bookkeeping survives the rollback of the main operation.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use mockable::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::batch::IngestionBatch;
use super::error::IngestionError;
use super::failure::FailureCategory;
use super::ports::BatchRepository;
use super::types::BatchId;

/// Transaction handle issued by a [`TransactionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

tokio::task_local! {
    static AMBIENT_TX: TxId;
}

/// Transaction the current task is running in, if any
pub fn current_transaction() -> Option<TxId> {
    AMBIENT_TX.try_with(|tx| *tx).ok()
}

/// Storage-level transaction control
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self, read_only: bool) -> Result<TxId, IngestionError>;

    async fn commit(&self, tx: TxId) -> Result<(), IngestionError>;

    async fn rollback(&self, tx: TxId) -> Result<(), IngestionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Join the ambient transaction, or start one
    Required,
    /// Always start an independent transaction
    RequiresNew,
}

#[derive(Debug, Clone)]
pub struct TransactionDefinition {
    pub name: String,
    pub propagation: Propagation,
    pub timeout: Duration,
    pub read_only: bool,
}

impl TransactionDefinition {
    pub fn new(name: impl Into<String>, propagation: Propagation, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            propagation,
            timeout,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// `transaction` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransactionConfig {
    pub timeout_seconds: u64,
    pub health_check_timeout_seconds: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            health_check_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionHealthStatus {
    pub is_healthy: bool,
    pub status_message: String,
    /// Result of the probe query (batch count), 0 when unhealthy
    pub batch_count: u64,
    pub checked_at: DateTime<Utc>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct TransactionCoordinator {
    manager: Arc<dyn TransactionManager>,
    batches: Arc<dyn BatchRepository>,
    clock: Arc<dyn Clock>,
    config: TransactionConfig,
}

impl TransactionCoordinator {
    pub fn new(
        manager: Arc<dyn TransactionManager>,
        batches: Arc<dyn BatchRepository>,
        clock: Arc<dyn Clock>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            manager,
            batches,
            clock,
            config,
        }
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    /// Run `work` under `definition`
    pub async fn execute<T, Fut>(
        &self,
        definition: &TransactionDefinition,
        work: Fut,
    ) -> Result<T, IngestionError>
    where
        Fut: Future<Output = Result<T, IngestionError>> + Send,
        T: Send,
    {
        if definition.propagation == Propagation::Required
            && let Some(tx) = current_transaction()
        {
            debug!(operation = %definition.name, tx = %tx, "Joining ambient transaction");
            return work.await;
        }

        let tx = self.manager.begin(definition.read_only).await?;
        debug!(operation = %definition.name, tx = %tx, "Transaction started");

        let guarded = AMBIENT_TX.scope(tx, AssertUnwindSafe(work).catch_unwind());
        let outcome = match tokio::time::timeout(definition.timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => {
                let message = panic_message(payload);
                error!(operation = %definition.name, tx = %tx, panic = %message, "Unit of work panicked");
                Err(IngestionError::Internal(format!(
                    "panic in '{}': {}",
                    definition.name, message
                )))
            }
            Err(_) => Err(IngestionError::TransactionTimeout {
                operation: definition.name.clone(),
                timeout_secs: definition.timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(value) => {
                if let Err(e) = self.manager.commit(tx).await {
                    error!(operation = %definition.name, tx = %tx, error = %e, "Commit failed");
                    return Err(IngestionError::TransactionFailed {
                        operation: definition.name.clone(),
                        reason: e.to_string(),
                    });
                }
                debug!(operation = %definition.name, tx = %tx, "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                match self.manager.rollback(tx).await {
                    Ok(()) => warn!(
                        operation = %definition.name,
                        tx = %tx,
                        error = %e,
                        "Transaction rolled back"
                    ),
                    // Double fault: report, but keep the original failure
                    Err(rollback_error) => error!(
                        operation = %definition.name,
                        tx = %tx,
                        error = %e,
                        rollback_error = %rollback_error,
                        "Rollback failed"
                    ),
                }
                Err(e)
            }
        }
    }

    /// Join-or-create with the configured timeout
    pub async fn execute_in_transaction<T, Fut>(
        &self,
        name: &str,
        work: Fut,
    ) -> Result<T, IngestionError>
    where
        Fut: Future<Output = Result<T, IngestionError>> + Send,
        T: Send,
    {
        let definition =
            TransactionDefinition::new(name, Propagation::Required, self.default_timeout());
        self.execute(&definition, work).await
    }

    /// Independent transaction, unaffected by the caller's rollback
    pub async fn execute_in_new_transaction<T, Fut>(
        &self,
        name: &str,
        work: Fut,
    ) -> Result<T, IngestionError>
    where
        Fut: Future<Output = Result<T, IngestionError>> + Send,
        T: Send,
    {
        let definition =
            TransactionDefinition::new(name, Propagation::RequiresNew, self.default_timeout());
        self.execute(&definition, work).await
    }

    /// Run `operations` in order inside one transaction, stopping at the
    /// first failure. Everything done before it is rolled back.
    pub async fn execute_multiple_operations<'a, T>(
        &self,
        name: &str,
        operations: Vec<BoxFuture<'a, Result<T, IngestionError>>>,
    ) -> Result<Vec<T>, IngestionError>
    where
        T: Send + 'a,
    {
        let operation = name.to_string();
        self.execute_in_transaction(name, async move {
            let mut results = Vec::with_capacity(operations.len());
            for (index, op) in operations.into_iter().enumerate() {
                match op.await {
                    Ok(value) => results.push(value),
                    Err(e) => {
                        warn!(operation = %operation, index, error = %e, "Composite operation step failed");
                        return Err(IngestionError::CompositeOperationFailed {
                            operation,
                            index,
                            completed: index,
                            source: Box::new(e),
                        });
                    }
                }
            }
            Ok(results)
        })
        .await
    }

    /// Load `batch_id` and run `operation` on it in one transaction.
    ///
    /// If the operation fails the transaction rolls back and the batch is
    /// then marked FAILED in an independent transaction, so the failure
    /// survives the rollback. A concurrency conflict is returned as-is:
    /// another writer owns the batch.
    pub async fn execute_batch_processing_transaction<T, F, Fut>(
        &self,
        batch_id: &BatchId,
        operation: F,
    ) -> Result<T, IngestionError>
    where
        F: FnOnce(IngestionBatch) -> Fut + Send,
        Fut: Future<Output = Result<T, IngestionError>> + Send,
        T: Send,
    {
        let name = format!("batch-processing-{}", batch_id);
        info!(batch_id = %batch_id, "Starting batch processing transaction");

        let result = self
            .execute_in_transaction(&name, async {
                let batch = self
                    .batches
                    .find_by_batch_id(batch_id)
                    .await?
                    .ok_or_else(|| IngestionError::BatchNotFound(batch_id.clone()))?;
                debug!(batch_id = %batch_id, status = %batch.status, "Loaded batch");
                operation(batch).await
            })
            .await;

        if let Err(e) = &result {
            error!(batch_id = %batch_id, error = %e, "Batch processing failed");
            if !matches!(
                e,
                IngestionError::BatchNotFound(_) | IngestionError::ConcurrentModification { .. }
            ) && let Err(mark_error) = self.mark_batch_failed(batch_id, e).await
            {
                error!(
                    batch_id = %batch_id,
                    error = %mark_error,
                    "Failed to mark batch as failed"
                );
            }
        } else {
            info!(batch_id = %batch_id, "Batch processing transaction completed");
        }
        result
    }

    /// Move a non-terminal batch to FAILED in its own transaction.
    ///
    /// Returns `None` when the batch is missing or already terminal.
    pub async fn mark_batch_failed(
        &self,
        batch_id: &BatchId,
        cause: &IngestionError,
    ) -> Result<Option<IngestionBatch>, IngestionError> {
        self.execute_in_new_transaction("mark-batch-failed", async {
            let Some(batch) = self.batches.find_by_batch_id(batch_id).await? else {
                return Ok(None);
            };
            if batch.is_terminal() {
                return Ok(None);
            }
            let failed = batch.mark_as_failed(cause.to_batch_failure(), self.clock.utc())?;
            self.batches.save(&failed).await.map(Some)
        })
        .await
    }

    /// Trivial read-only transaction against the batch store
    pub async fn check_health(&self) -> TransactionHealthStatus {
        let definition = TransactionDefinition::new(
            "transaction-health-check",
            Propagation::RequiresNew,
            Duration::from_secs(self.config.health_check_timeout_seconds),
        )
        .read_only();

        let checked_at = self.clock.utc();
        match self.execute(&definition, self.batches.count()).await {
            Ok(batch_count) => {
                debug!(batch_count, "Transaction health check passed");
                TransactionHealthStatus {
                    is_healthy: true,
                    status_message: "Transaction manager is healthy".to_string(),
                    batch_count,
                    checked_at,
                }
            }
            Err(e) => {
                error!(error = %e, "Transaction health check failed");
                TransactionHealthStatus {
                    is_healthy: false,
                    status_message: format!("Transaction health check failed: {}", e),
                    batch_count: 0,
                    checked_at,
                }
            }
        }
    }

    /// Operator guidance for a failed transaction
    pub fn recovery_recommendations(error: &IngestionError) -> Vec<&'static str> {
        let timeout = matches!(error, IngestionError::TransactionTimeout { .. })
            || error.failure_category() == FailureCategory::Timeout;
        let connectivity = matches!(error, IngestionError::Database(_))
            || matches!(
                error.failure_category(),
                FailureCategory::Connection | FailureCategory::Network | FailureCategory::Unavailable
            );
        let constraint = matches!(
            error,
            IngestionError::DuplicateBatch(_) | IngestionError::ConcurrentModification { .. }
        );
        let aborted = matches!(error, IngestionError::TransactionFailed { .. });

        let mut recommendations = Vec::new();
        if timeout {
            recommendations.extend([
                "Consider reducing transaction scope or increasing timeout values",
                "Check for long-running operations that might be causing deadlocks",
                "Review database indexes to improve query performance",
            ]);
        }
        if connectivity {
            recommendations.extend([
                "Check database connectivity and network stability",
                "Verify database connection pool configuration",
                "Consider implementing connection retry logic",
            ]);
        }
        if constraint {
            recommendations.extend([
                "Review data integrity constraints and validation logic",
                "Check for duplicate key violations or concurrent updates",
                "Validate input data before starting transactions",
            ]);
        }
        if aborted {
            recommendations.extend([
                "Review transaction boundaries and error handling",
                "Implement proper cleanup procedures after rollback",
            ]);
        }
        if recommendations.is_empty() {
            recommendations.extend([
                "Review transaction logs for detailed error information",
                "Consider implementing retry logic for transient failures",
                "Verify database health and resource availability",
            ]);
        }
        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryBatchStore;
    use crate::ingestion::state::BatchStatus;
    use crate::ingestion::test_support::{MutableClock, uploaded_batch};

    fn setup() -> (Arc<InMemoryBatchStore>, TransactionCoordinator) {
        let store = Arc::new(InMemoryBatchStore::new());
        let coordinator = TransactionCoordinator::new(
            store.clone(),
            store.clone(),
            Arc::new(MutableClock::fixed()),
            TransactionConfig::default(),
        );
        (store, coordinator)
    }

    #[tokio::test]
    async fn test_commit_keeps_writes() {
        let (store, coordinator) = setup();
        let batch = uploaded_batch("batch_1");

        coordinator
            .execute_in_transaction("insert", store.insert(&batch))
            .await
            .unwrap();
        assert!(store.get(&batch.batch_id).is_some());
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_error_rolls_back_writes() {
        let (store, coordinator) = setup();
        let batch = uploaded_batch("batch_1");

        let result: Result<(), _> = coordinator
            .execute_in_transaction("insert-then-fail", async {
                store.insert(&batch).await?;
                Err(IngestionError::dependency(
                    "storage",
                    FailureCategory::Unavailable,
                    "down",
                ))
            })
            .await;
        assert!(result.is_err());
        assert!(store.get(&batch.batch_id).is_none());
    }

    #[tokio::test]
    async fn test_requires_new_survives_outer_rollback() {
        let (store, coordinator) = setup();
        let outer = uploaded_batch("batch_outer");
        let inner = uploaded_batch("batch_inner");

        let result: Result<(), _> = coordinator
            .execute_in_transaction("outer", async {
                store.insert(&outer).await?;
                coordinator
                    .execute_in_new_transaction("inner", store.insert(&inner))
                    .await?;
                Err(IngestionError::Internal("outer fails".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(store.get(&outer.batch_id).is_none());
        assert!(store.get(&inner.batch_id).is_some());
    }

    #[tokio::test]
    async fn test_required_joins_ambient_transaction() {
        let (store, coordinator) = setup();
        let batch = uploaded_batch("batch_1");

        let result: Result<(), _> = coordinator
            .execute_in_transaction("outer", async {
                let outer_tx = current_transaction();
                coordinator
                    .execute_in_transaction("inner", async {
                        assert_eq!(current_transaction(), outer_tx);
                        store.insert(&batch).await
                    })
                    .await?;
                Err(IngestionError::Internal("outer fails".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(store.get(&batch.batch_id).is_none());
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let store = Arc::new(InMemoryBatchStore::new());
        let coordinator = TransactionCoordinator::new(
            store.clone(),
            store.clone(),
            Arc::new(MutableClock::fixed()),
            TransactionConfig {
                timeout_seconds: 0,
                health_check_timeout_seconds: 5,
            },
        );
        let batch = uploaded_batch("batch_1");

        let err = coordinator
            .execute_in_transaction("slow", async {
                store.insert(&batch).await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IngestionError::TransactionTimeout { .. }));
        assert!(err.is_recoverable());
        assert!(store.get(&batch.batch_id).is_none());
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_rolled_back() {
        let (store, coordinator) = setup();
        let batch = uploaded_batch("batch_1");

        let err = coordinator
            .execute_in_transaction("panicky", async {
                store.insert(&batch).await?;
                if batch.version == 0 {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IngestionError::Internal(ref m) if m.contains("boom")));
        assert!(store.get(&batch.batch_id).is_none());
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_error() {
        let (store, coordinator) = setup();
        store.fail_rollbacks(true);

        let err = coordinator
            .execute_in_transaction::<(), _>("double-fault", async {
                Err(IngestionError::MissingS3Reference)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::MissingS3Reference));
    }

    #[tokio::test]
    async fn test_multiple_operations_stop_at_first_failure() {
        let (store, coordinator) = setup();
        let a = uploaded_batch("batch_a");
        let b = uploaded_batch("batch_b");
        let c = uploaded_batch("batch_c");

        let ops: Vec<BoxFuture<'_, Result<(), IngestionError>>> = vec![
            Box::pin(async { store.insert(&a).await.map(|_| ()) }),
            Box::pin(async { Err(IngestionError::MissingExposureCount) }),
            Box::pin(async { store.insert(&c).await.map(|_| ()) }),
        ];
        let err = coordinator
            .execute_multiple_operations("three-step", ops)
            .await
            .unwrap_err();

        match err {
            IngestionError::CompositeOperationFailed {
                index, completed, ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(completed, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.get(&a.batch_id).is_none());
        assert!(store.get(&b.batch_id).is_none());
        assert!(store.get(&c.batch_id).is_none());
    }

    #[tokio::test]
    async fn test_batch_processing_failure_marks_batch_failed() {
        let (store, coordinator) = setup();
        let batch = uploaded_batch("batch_1");
        store.insert(&batch).await.unwrap();

        let err = coordinator
            .execute_batch_processing_transaction(&batch.batch_id, |b| {
                let store = store.clone();
                async move {
                    let (parsing, _) = b.start_processing(Utc::now())?;
                    store.save(&parsing).await?;
                    Err::<(), _>(IngestionError::rejected(FailureCategory::Parse, "bad row 7"))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Rejected { .. }));

        // PARSING was rolled back; the failure was recorded independently
        let stored = store.get(&batch.batch_id).unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
        let failure = stored.failure.clone().unwrap();
        assert_eq!(failure.category, FailureCategory::Parse);
    }

    #[tokio::test]
    async fn test_batch_processing_missing_batch() {
        let (_, coordinator) = setup();
        let err = coordinator
            .execute_batch_processing_transaction(&BatchId::new("nope"), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::BatchNotFound(_)));
    }

    #[tokio::test]
    async fn test_health_check() {
        let (store, coordinator) = setup();
        store.insert(&uploaded_batch("batch_1")).await.unwrap();

        let health = coordinator.check_health().await;
        assert!(health.is_healthy);
        assert_eq!(health.batch_count, 1);

        store.set_available(false);
        let health = coordinator.check_health().await;
        assert!(!health.is_healthy);
        assert!(health.status_message.contains("failed"));
    }

    #[test]
    fn test_recovery_recommendations() {
        let timeout = IngestionError::TransactionTimeout {
            operation: "x".into(),
            timeout_secs: 30,
        };
        let recs = TransactionCoordinator::recovery_recommendations(&timeout);
        assert!(recs[0].contains("timeout"));

        let recs =
            TransactionCoordinator::recovery_recommendations(&IngestionError::Database("x".into()));
        assert!(recs.iter().any(|r| r.contains("connectivity")));

        let recs =
            TransactionCoordinator::recovery_recommendations(&IngestionError::MissingS3Reference);
        assert_eq!(recs.len(), 3);
        assert!(recs[0].contains("transaction logs"));
    }
}
