//! Filesystem object storage
//!
//! Stores batch files under `{root}/{bucket}/raw/{bank}/{batch}/{file}` with
//! a JSON sidecar carrying the object metadata. Objects are written to a
//! temporary name and renamed into place, so a reader never sees a partial
//! file. Keys are deterministic; storing the same batch again overwrites.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ingestion::{
    BankId, BatchId, FailureCategory, FileMetadata, IngestionError, S3Reference, StorageService,
};

const SERVICE: &str = "storage";

/// Object metadata written next to each stored file
#[derive(Debug, Serialize)]
struct ObjectMetadata<'a> {
    batch_id: &'a str,
    bank_id: &'a str,
    content_type: &'a str,
    md5_checksum: &'a str,
    file_size_bytes: u64,
    exposure_count: u64,
}

pub struct LocalObjectStorage {
    root: PathBuf,
    bucket: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    fn bucket_dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.bucket_dir().join(key)
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }
}

fn io_error(context: &str, error: io::Error) -> IngestionError {
    let category = match error.kind() {
        io::ErrorKind::TimedOut => FailureCategory::Timeout,
        io::ErrorKind::PermissionDenied => FailureCategory::Authorization,
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => FailureCategory::Temporary,
        _ => FailureCategory::Unavailable,
    };
    IngestionError::dependency(SERVICE, category, format!("{}: {}", context, error))
}

/// Object key for a batch file; only the final path component of the
/// uploaded name is used
fn object_key(
    bank_id: &BankId,
    batch_id: &BatchId,
    file_name: &str,
) -> Result<String, IngestionError> {
    let name = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            IngestionError::rejected(
                FailureCategory::Validation,
                format!("invalid file name '{}'", file_name),
            )
        })?;
    Ok(format!("raw/{}/{}/{}", bank_id, batch_id, name))
}

#[async_trait]
impl StorageService for LocalObjectStorage {
    async fn store_file(
        &self,
        content: &[u8],
        metadata: &FileMetadata,
        batch_id: &BatchId,
        bank_id: &BankId,
        exposure_count: u64,
    ) -> Result<S3Reference, IngestionError> {
        let actual = format!("{:x}", md5::compute(content));
        if !actual.eq_ignore_ascii_case(metadata.md5_checksum.trim()) {
            return Err(IngestionError::rejected(
                FailureCategory::Checksum,
                format!(
                    "checksum mismatch for {}: declared {}, computed {}",
                    metadata.file_name, metadata.md5_checksum, actual
                ),
            ));
        }

        let key = object_key(bank_id, batch_id, &metadata.file_name)?;
        let path = self.object_path(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create object directory", e))?;
        }

        let staging = path.with_extension("partial");
        tokio::fs::write(&staging, content)
            .await
            .map_err(|e| io_error("write object", e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| io_error("publish object", e))?;

        let sidecar = ObjectMetadata {
            batch_id: batch_id.as_str(),
            bank_id: bank_id.as_str(),
            content_type: &metadata.content_type,
            md5_checksum: &actual,
            file_size_bytes: content.len() as u64,
            exposure_count,
        };
        let sidecar = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| IngestionError::Internal(format!("object metadata: {}", e)))?;
        tokio::fs::write(Self::sidecar_path(&path), sidecar)
            .await
            .map_err(|e| io_error("write object metadata", e))?;

        let reference = S3Reference::new(self.bucket.clone(), key);
        info!(batch_id = %batch_id, uri = %reference.uri, bytes = content.len(), "Stored batch file");
        Ok(reference)
    }

    async fn check_health(&self) -> bool {
        let dir = self.bucket_dir();
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Storage directory unavailable");
            return false;
        }
        match tokio::fs::metadata(&dir).await {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Storage health check failed");
                false
            }
        }
    }

    async fn delete_file(&self, reference: &S3Reference) -> Result<(), IngestionError> {
        if reference.bucket != self.bucket {
            return Err(IngestionError::rejected(
                FailureCategory::Validation,
                format!("object {} is not in bucket {}", reference.uri, self.bucket),
            ));
        }
        let path = self.object_path(&reference.key);
        for target in [Self::sidecar_path(&path), path] {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => debug!(path = %target.display(), "Deleted object"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("delete object", e)),
            }
        }
        Ok(())
    }
}
