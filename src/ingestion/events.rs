//! Batch Events
//!
//! Domain events emitted by successful transitions, plus the terminal
//! notifications consumed by downstream risk calculation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::failure::FailureCategory;
use super::types::{BankId, BatchId, S3Reference};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    ProcessingStarted {
        batch_id: BatchId,
        bank_id: BankId,
        at: DateTime<Utc>,
    },
    Validated {
        batch_id: BatchId,
        bank_id: BankId,
        exposure_count: u64,
        at: DateTime<Utc>,
    },
    Stored {
        batch_id: BatchId,
        bank_id: BankId,
        s3_reference: S3Reference,
        at: DateTime<Utc>,
    },
    Completed {
        batch_id: BatchId,
        bank_id: BankId,
        s3_reference: S3Reference,
        exposure_count: u64,
        file_size_bytes: u64,
        at: DateTime<Utc>,
    },
    /// Published by the pipeline only; failure transitions emit no domain event
    Failed {
        batch_id: BatchId,
        bank_id: BankId,
        category: FailureCategory,
        message: String,
        at: DateTime<Utc>,
    },
}

impl BatchEvent {
    pub fn batch_id(&self) -> &BatchId {
        match self {
            BatchEvent::ProcessingStarted { batch_id, .. }
            | BatchEvent::Validated { batch_id, .. }
            | BatchEvent::Stored { batch_id, .. }
            | BatchEvent::Completed { batch_id, .. }
            | BatchEvent::Failed { batch_id, .. } => batch_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BatchEvent::ProcessingStarted { .. } => "BatchProcessingStarted",
            BatchEvent::Validated { .. } => "BatchValidated",
            BatchEvent::Stored { .. } => "BatchStored",
            BatchEvent::Completed { .. } => "BatchCompleted",
            BatchEvent::Failed { .. } => "BatchFailed",
        }
    }

    /// Terminal notifications go to downstream consumers
    pub fn is_terminal_notification(&self) -> bool {
        matches!(self, BatchEvent::Completed { .. } | BatchEvent::Failed { .. })
    }
}
