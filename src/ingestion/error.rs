//! Ingestion Error Types
//!
//! Every error carries a stable code, a taxonomy class and a failure
//! category so callers never have to inspect message text.

use thiserror::Error;

use super::failure::{BatchFailure, FailureCategory};
use super::state::BatchStatus;
use super::types::{BankId, BatchId};

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Illegal status change requested (ordering bug, never retried)
    StateTransition,
    /// Required artifact missing or bad argument (never retried)
    Validation,
    /// Registry, storage, database or transaction trouble
    Dependency,
    /// Bad data or denied access (batch fails, no automatic recovery)
    TerminalBusiness,
    /// Unexpected condition (panic inside a unit of work, poisoned state)
    Internal,
}

/// Ingestion error types
#[derive(Error, Debug, Clone)]
pub enum IngestionError {
    // === State-transition violations ===
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: BatchStatus, to: BatchStatus },

    #[error("Checkpoint requested at {requested} but batch is {actual}")]
    CheckpointStatusMismatch {
        requested: BatchStatus,
        actual: BatchStatus,
    },

    #[error("Batch {batch_id} was modified concurrently (expected version {expected_version})")]
    ConcurrentModification {
        batch_id: BatchId,
        expected_version: u64,
    },

    // === Validation failures ===
    #[error("Exposure count cannot be negative: {0}")]
    NegativeExposureCount(i64),

    #[error("Bank info {actual} does not match batch bank {expected}")]
    BankIdMismatch { expected: BankId, actual: BankId },

    #[error("Cannot complete ingestion without storage reference")]
    MissingS3Reference,

    #[error("Cannot complete ingestion without exposure count")]
    MissingExposureCount,

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Batch already exists: {0}")]
    DuplicateBatch(BatchId),

    // === Dependency failures ===
    #[error("{service} failure ({category}): {message}")]
    Dependency {
        service: &'static str,
        category: FailureCategory,
        message: String,
    },

    #[error(
        "Bank Registry service is unavailable and no cached information exists for bank {0}"
    )]
    RegistryUnavailableNoCache(BankId),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transaction '{operation}' exceeded its {timeout_secs}s timeout")]
    TransactionTimeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("Transaction '{operation}' failed: {reason}")]
    TransactionFailed { operation: String, reason: String },

    #[error("Operation {index} of '{operation}' failed after {completed} succeeded: {source}")]
    CompositeOperationFailed {
        operation: String,
        index: usize,
        completed: usize,
        #[source]
        source: Box<IngestionError>,
    },

    // === Terminal business failures ===
    #[error("Input rejected ({category}): {message}")]
    Rejected {
        category: FailureCategory,
        message: String,
    },

    #[error("Cannot process batch for inactive bank {0}")]
    BankInactive(BankId),

    #[error("Bank not registered: {0}")]
    BankNotFound(BankId),

    #[error("Maximum recovery attempts ({attempts}) exceeded for batch {batch_id}")]
    MaxRecoveryAttemptsExceeded { batch_id: BatchId, attempts: u32 },

    #[error("Batch {batch_id} failure is not recoverable: {message}")]
    NonRecoverableFailure { batch_id: BatchId, message: String },

    // === Internal ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestionError {
    /// Dependency failure tagged at the source
    pub fn dependency(
        service: &'static str,
        category: FailureCategory,
        message: impl Into<String>,
    ) -> Self {
        IngestionError::Dependency {
            service,
            category,
            message: message.into(),
        }
    }

    /// Input rejected by a collaborator (parser, validator, storage checksum)
    pub fn rejected(category: FailureCategory, message: impl Into<String>) -> Self {
        IngestionError::Rejected {
            category,
            message: message.into(),
        }
    }

    /// Get the error code for API responses and failure records
    pub fn code(&self) -> &'static str {
        match self {
            IngestionError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            IngestionError::CheckpointStatusMismatch { .. } => "CHECKPOINT_STATUS_MISMATCH",
            IngestionError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            IngestionError::NegativeExposureCount(_) => "INVALID_EXPOSURE_COUNT",
            IngestionError::BankIdMismatch { .. } => "BANK_ID_MISMATCH",
            IngestionError::MissingS3Reference => "MISSING_S3_REFERENCE",
            IngestionError::MissingExposureCount => "MISSING_EXPOSURE_COUNT",
            IngestionError::BatchNotFound(_) => "BATCH_NOT_FOUND",
            IngestionError::DuplicateBatch(_) => "DUPLICATE_BATCH",
            IngestionError::Dependency { .. } => "DEPENDENCY_FAILURE",
            IngestionError::RegistryUnavailableNoCache(_) => "BANK_REGISTRY_UNAVAILABLE_NO_CACHE",
            IngestionError::Database(_) => "DATABASE_ERROR",
            IngestionError::TransactionTimeout { .. } => "TRANSACTION_TIMEOUT",
            IngestionError::TransactionFailed { .. } => "TRANSACTION_FAILED",
            IngestionError::CompositeOperationFailed { .. } => "COMPOSITE_OPERATION_FAILED",
            IngestionError::Rejected { .. } => "INPUT_REJECTED",
            IngestionError::BankInactive(_) => "BANK_INACTIVE",
            IngestionError::BankNotFound(_) => "BANK_NOT_FOUND",
            IngestionError::MaxRecoveryAttemptsExceeded { .. } => "MAX_RECOVERY_ATTEMPTS_EXCEEDED",
            IngestionError::NonRecoverableFailure { .. } => "NON_RECOVERABLE_FAILURE",
            IngestionError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Taxonomy class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestionError::InvalidStateTransition { .. }
            | IngestionError::CheckpointStatusMismatch { .. }
            | IngestionError::ConcurrentModification { .. } => ErrorClass::StateTransition,
            IngestionError::NegativeExposureCount(_)
            | IngestionError::BankIdMismatch { .. }
            | IngestionError::MissingS3Reference
            | IngestionError::MissingExposureCount
            | IngestionError::BatchNotFound(_)
            | IngestionError::DuplicateBatch(_) => ErrorClass::Validation,
            IngestionError::Dependency { .. }
            | IngestionError::RegistryUnavailableNoCache(_)
            | IngestionError::Database(_)
            | IngestionError::TransactionTimeout { .. }
            | IngestionError::TransactionFailed { .. } => ErrorClass::Dependency,
            IngestionError::CompositeOperationFailed { source, .. } => source.class(),
            IngestionError::Rejected { .. }
            | IngestionError::BankInactive(_)
            | IngestionError::BankNotFound(_)
            | IngestionError::MaxRecoveryAttemptsExceeded { .. }
            | IngestionError::NonRecoverableFailure { .. } => ErrorClass::TerminalBusiness,
            IngestionError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Failure category recorded on the batch when this error fails it
    pub fn failure_category(&self) -> FailureCategory {
        match self {
            IngestionError::Dependency { category, .. }
            | IngestionError::Rejected { category, .. } => *category,
            IngestionError::RegistryUnavailableNoCache(_) => FailureCategory::Unavailable,
            IngestionError::Database(_) | IngestionError::TransactionFailed { .. } => {
                FailureCategory::Connection
            }
            IngestionError::TransactionTimeout { .. } => FailureCategory::Timeout,
            IngestionError::CompositeOperationFailed { source, .. } => source.failure_category(),
            IngestionError::NegativeExposureCount(_)
            | IngestionError::BankIdMismatch { .. }
            | IngestionError::BankInactive(_)
            | IngestionError::BankNotFound(_)
            | IngestionError::MissingS3Reference
            | IngestionError::MissingExposureCount => FailureCategory::Validation,
            IngestionError::InvalidStateTransition { .. }
            | IngestionError::CheckpointStatusMismatch { .. }
            | IngestionError::BatchNotFound(_)
            | IngestionError::DuplicateBatch(_)
            | IngestionError::MaxRecoveryAttemptsExceeded { .. }
            | IngestionError::NonRecoverableFailure { .. }
            | IngestionError::Internal(_) => FailureCategory::Unknown,
            IngestionError::ConcurrentModification { .. } => FailureCategory::Temporary,
        }
    }

    /// Whether RecoveryService may retry a batch failed by this error
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        self.failure_category().is_recoverable()
    }

    /// Convert into the failure stored on the batch
    pub fn to_batch_failure(&self) -> BatchFailure {
        BatchFailure::new(self.failure_category(), self.to_string())
    }
}

impl From<sqlx::Error> for IngestionError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => IngestionError::dependency(
                "database",
                FailureCategory::Timeout,
                "connection pool timed out",
            ),
            other => IngestionError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            IngestionError::InvalidStateTransition {
                from: BatchStatus::Failed,
                to: BatchStatus::Failed
            }
            .code(),
            "INVALID_STATE_TRANSITION"
        );
        assert_eq!(
            IngestionError::RegistryUnavailableNoCache(BankId::new("B1")).code(),
            "BANK_REGISTRY_UNAVAILABLE_NO_CACHE"
        );
        assert_eq!(IngestionError::MissingS3Reference.code(), "MISSING_S3_REFERENCE");
    }

    #[test]
    fn test_classes() {
        assert_eq!(
            IngestionError::MissingExposureCount.class(),
            ErrorClass::Validation
        );
        assert_eq!(
            IngestionError::dependency("storage", FailureCategory::Timeout, "slow").class(),
            ErrorClass::Dependency
        );
        assert_eq!(
            IngestionError::rejected(FailureCategory::Parse, "bad json").class(),
            ErrorClass::TerminalBusiness
        );
    }

    #[test]
    fn test_recoverability_follows_category() {
        assert!(IngestionError::RegistryUnavailableNoCache(BankId::new("B1")).is_recoverable());
        assert!(
            IngestionError::TransactionTimeout {
                operation: "x".into(),
                timeout_secs: 30
            }
            .is_recoverable()
        );
        assert!(!IngestionError::BankInactive(BankId::new("B1")).is_recoverable());
        assert!(!IngestionError::rejected(FailureCategory::Checksum, "md5").is_recoverable());
    }

    #[test]
    fn test_composite_delegates_to_source() {
        let err = IngestionError::CompositeOperationFailed {
            operation: "store".into(),
            index: 1,
            completed: 1,
            source: Box::new(IngestionError::MissingS3Reference),
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.failure_category(), FailureCategory::Validation);
    }

    #[test]
    fn test_batch_failure_keeps_category() {
        let failure =
            IngestionError::dependency("bank-registry", FailureCategory::Connection, "refused")
                .to_batch_failure();
        assert_eq!(failure.category, FailureCategory::Connection);
        assert!(failure.message.contains("refused"));
    }
}
