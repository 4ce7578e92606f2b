//! Ingestion Core Types
//!
//! Identifiers and value objects shared by the batch FSM and its ports.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Bank info older than this is stale (still usable as a fallback)
pub const BANK_INFO_FRESHNESS_HOURS: i64 = 24;

/// Batch identifier
///
/// Caller-supplied, or generated as `batch_<ULID>` so generated IDs are
/// sortable by creation time without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a new unique BatchId
    pub fn generate() -> Self {
        Self(format!("batch_{}", ulid::Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bank identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BankId(String);

impl BankId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry status of a bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankStatus {
    Active,
    Inactive,
    Suspended,
}

impl BankStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BankStatus::Active => "ACTIVE",
            BankStatus::Inactive => "INACTIVE",
            BankStatus::Suspended => "SUSPENDED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(BankStatus::Active),
            "INACTIVE" => Some(BankStatus::Inactive),
            "SUSPENDED" => Some(BankStatus::Suspended),
            _ => None,
        }
    }
}

/// Authoritative bank metadata (enrichment result)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankInfo {
    pub bank_id: BankId,
    pub bank_name: String,
    pub bank_country: String,
    pub status: BankStatus,
    pub last_updated: DateTime<Utc>,
}

impl BankInfo {
    pub fn new(
        bank_id: BankId,
        bank_name: impl Into<String>,
        bank_country: impl Into<String>,
        status: BankStatus,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            bank_id,
            bank_name: bank_name.into(),
            bank_country: bank_country.into(),
            status,
            last_updated,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == BankStatus::Active
    }

    /// Fresh enough to be treated as current registry data
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.last_updated < Duration::hours(BANK_INFO_FRESHNESS_HOURS)
    }
}

/// Uploaded file description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub content_type: String,
    pub file_size_bytes: u64,
    /// Hex MD5 of the content as declared by the uploader
    pub md5_checksum: String,
}

impl FileMetadata {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        file_size_bytes: u64,
        md5_checksum: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            file_size_bytes,
            md5_checksum: md5_checksum.into(),
        }
    }

    /// Describe in-memory content, computing its checksum
    pub fn for_content(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        content: &[u8],
    ) -> Self {
        Self::new(
            file_name,
            content_type,
            content.len() as u64,
            format!("{:x}", md5::compute(content)),
        )
    }
}

/// Durable storage location of a batch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Reference {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub uri: String,
}

impl S3Reference {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        let uri = format!("s3://{}/{}", bucket, key);
        Self {
            bucket,
            key,
            version_id: None,
            uri,
        }
    }
}

impl fmt::Display for S3Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}
