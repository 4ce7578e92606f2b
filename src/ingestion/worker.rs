//! Recovery Worker
//!
//! Background worker that periodically runs the bulk recovery pass.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::IngestionError;
use super::recovery::{BulkRecoveryReport, RecoveryConfig, RecoveryService};

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stuck batches
    pub scan_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl From<&RecoveryConfig> for WorkerConfig {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.checkpoint_interval_minutes * 60),
        }
    }
}

/// Recovery Worker
///
/// Periodically scans for batches stuck in PARSING, VALIDATED or STORING
/// and resumes them. Per-batch failures never stop the loop.
pub struct RecoveryWorker {
    service: Arc<RecoveryService>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(service: Arc<RecoveryService>, config: WorkerConfig) -> Self {
        Self { service, config }
    }

    /// Scan period taken from the service's recovery configuration
    pub fn with_defaults(service: Arc<RecoveryService>) -> Self {
        let config = WorkerConfig::from(service.config());
        Self::new(service, config)
    }

    /// Run the recovery worker loop
    ///
    /// This method runs forever.
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stuck_timeout_minutes = self.service.config().stuck_batch_timeout_minutes,
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_and_recover(&self) -> Result<BulkRecoveryReport, IngestionError> {
        let report = self.service.recover_stuck_batches().await?;

        if report.scanned == 0 {
            debug!("No stuck batches found");
            return Ok(report);
        }

        for failure in &report.errors {
            if matches!(
                failure.error,
                IngestionError::MaxRecoveryAttemptsExceeded { .. }
                    | IngestionError::NonRecoverableFailure { .. }
            ) {
                warn!(
                    batch_id = %failure.batch_id,
                    error = %failure.error,
                    "Batch needs manual intervention"
                );
            }
        }

        if !report.recovered.is_empty() {
            info!(count = report.recovered.len(), "Recovered batches this scan");
        }
        Ok(report)
    }
}
