//! Batch FSM State Definitions
//!
//! State IDs are stable for PostgreSQL storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ingestion batch FSM states
///
/// State IDs are designed for PostgreSQL storage as SMALLINT.
/// Terminal states: COMPLETED (40), FAILED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum BatchStatus {
    /// File received and recorded, nothing processed yet
    Uploaded = 0,

    /// Parsing in progress
    Parsing = 10,

    /// Parsed and validated, exposure count known
    Validated = 20,

    /// Stored in object storage (or storage in progress)
    Storing = 30,

    /// Terminal: ingestion finished successfully
    Completed = 40,

    /// Terminal: ingestion failed
    Failed = -10,
}

impl BatchStatus {
    /// Every status, in forward order with FAILED last
    pub const ALL: [BatchStatus; 6] = [
        BatchStatus::Uploaded,
        BatchStatus::Parsing,
        BatchStatus::Validated,
        BatchStatus::Storing,
        BatchStatus::Completed,
        BatchStatus::Failed,
    ];

    /// Statuses scanned by the bulk recovery pass
    pub const IN_FLIGHT: [BatchStatus; 3] = [
        BatchStatus::Parsing,
        BatchStatus::Validated,
        BatchStatus::Storing,
    ];

    /// Check if this is a terminal state (no more forward transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Legal forward transition table
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Uploaded, Parsing)
                | (Uploaded, Failed)
                | (Parsing, Validated)
                | (Parsing, Failed)
                | (Validated, Storing)
                | (Validated, Failed)
                | (Storing, Completed)
                | (Storing, Failed)
        )
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(BatchStatus::Uploaded),
            10 => Some(BatchStatus::Parsing),
            20 => Some(BatchStatus::Validated),
            30 => Some(BatchStatus::Storing),
            40 => Some(BatchStatus::Completed),
            -10 => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Uploaded => "UPLOADED",
            BatchStatus::Parsing => "PARSING",
            BatchStatus::Validated => "VALIDATED",
            BatchStatus::Storing => "STORING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for BatchStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        BatchStatus::from_id(value).ok_or(())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown batch status: {}", s))
    }
}
