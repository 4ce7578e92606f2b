//! In-memory adapters
//!
//! Used by tests and local runs without PostgreSQL. Writes made inside a
//! transaction are journaled and undone in reverse order on rollback.
//! Transactions are not isolated from each other.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::ingestion::{
    BankId, BankInfo, BankInfoCache, BatchId, BatchRepository, BatchStatus, FailureCategory,
    FailureRecordRepository, IngestionBatch, IngestionError, ProcessingFailureRecord,
    TransactionManager, TxId, current_transaction,
};

/// Undo entry for one write
enum Undo {
    Restore(IngestionBatch),
    Remove(BatchId),
    DropFailure(u64),
}

/// Batch store, failure log and transaction manager in one
pub struct InMemoryBatchStore {
    batches: DashMap<BatchId, IngestionBatch>,
    failures: Mutex<Vec<(u64, ProcessingFailureRecord)>>,
    journals: DashMap<TxId, Vec<Undo>>,
    next_tx: AtomicU64,
    next_failure: AtomicU64,
    available: AtomicBool,
    fail_rollbacks: AtomicBool,
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self {
            batches: DashMap::new(),
            failures: Mutex::new(Vec::new()),
            journals: DashMap::new(),
            next_tx: AtomicU64::new(1),
            next_failure: AtomicU64::new(1),
            available: AtomicBool::new(true),
            fail_rollbacks: AtomicBool::new(false),
        }
    }

    /// Committed-or-pending snapshot, bypassing transactions
    pub fn get(&self, batch_id: &BatchId) -> Option<IngestionBatch> {
        self.batches.get(batch_id).map(|b| b.clone())
    }

    pub fn open_transactions(&self) -> usize {
        self.journals.len()
    }

    /// Simulate the store going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every rollback fail (double-fault testing)
    pub fn fail_rollbacks(&self, fail: bool) {
        self.fail_rollbacks.store(fail, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), IngestionError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IngestionError::dependency(
                "batch-store",
                FailureCategory::Connection,
                "connection refused",
            ))
        }
    }

    fn journal(&self, undo: Undo) {
        if let Some(tx) = current_transaction()
            && let Some(mut entries) = self.journals.get_mut(&tx)
        {
            entries.push(undo);
        }
    }

    fn lock_failures(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Vec<(u64, ProcessingFailureRecord)>>, IngestionError>
    {
        self.failures
            .lock()
            .map_err(|_| IngestionError::Internal("failure log lock poisoned".to_string()))
    }
}

#[async_trait]
impl TransactionManager for InMemoryBatchStore {
    async fn begin(&self, _read_only: bool) -> Result<TxId, IngestionError> {
        self.ensure_available()?;
        let tx = TxId(self.next_tx.fetch_add(1, Ordering::SeqCst));
        self.journals.insert(tx, Vec::new());
        Ok(tx)
    }

    async fn commit(&self, tx: TxId) -> Result<(), IngestionError> {
        self.journals.remove(&tx);
        Ok(())
    }

    async fn rollback(&self, tx: TxId) -> Result<(), IngestionError> {
        let entries = self.journals.remove(&tx).map(|(_, e)| e).unwrap_or_default();
        if self.fail_rollbacks.load(Ordering::SeqCst) {
            return Err(IngestionError::Database("rollback failed".to_string()));
        }

        debug!(tx = %tx, writes = entries.len(), "Undoing transaction");
        for undo in entries.into_iter().rev() {
            match undo {
                Undo::Restore(batch) => {
                    self.batches.insert(batch.batch_id.clone(), batch);
                }
                Undo::Remove(batch_id) => {
                    self.batches.remove(&batch_id);
                }
                Undo::DropFailure(seq) => {
                    self.lock_failures()?.retain(|(s, _)| *s != seq);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BatchRepository for InMemoryBatchStore {
    async fn find_by_batch_id(
        &self,
        batch_id: &BatchId,
    ) -> Result<Option<IngestionBatch>, IngestionError> {
        self.ensure_available()?;
        Ok(self.get(batch_id))
    }

    async fn insert(&self, batch: &IngestionBatch) -> Result<IngestionBatch, IngestionError> {
        self.ensure_available()?;
        match self.batches.entry(batch.batch_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(IngestionError::DuplicateBatch(batch.batch_id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(batch.clone());
                self.journal(Undo::Remove(batch.batch_id.clone()));
                Ok(batch.clone())
            }
        }
    }

    async fn save(&self, batch: &IngestionBatch) -> Result<IngestionBatch, IngestionError> {
        self.ensure_available()?;
        let mut stored = self
            .batches
            .get_mut(&batch.batch_id)
            .ok_or_else(|| IngestionError::BatchNotFound(batch.batch_id.clone()))?;
        if stored.version != batch.version {
            return Err(IngestionError::ConcurrentModification {
                batch_id: batch.batch_id.clone(),
                expected_version: batch.version,
            });
        }

        let previous = stored.clone();
        let saved = batch.with_version(batch.version + 1);
        *stored = saved.clone();
        drop(stored);

        self.journal(Undo::Restore(previous));
        Ok(saved)
    }

    async fn find_stuck_batches(
        &self,
        statuses: &[BatchStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IngestionBatch>, IngestionError> {
        self.ensure_available()?;
        let mut stuck: Vec<IngestionBatch> = self
            .batches
            .iter()
            .filter(|b| statuses.contains(&b.status) && b.updated_at < cutoff)
            .map(|b| b.clone())
            .collect();
        stuck.sort_by_key(|b| b.updated_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn count(&self) -> Result<u64, IngestionError> {
        self.ensure_available()?;
        Ok(self.batches.len() as u64)
    }
}

#[async_trait]
impl FailureRecordRepository for InMemoryBatchStore {
    async fn record(&self, record: &ProcessingFailureRecord) -> Result<(), IngestionError> {
        self.ensure_available()?;
        let seq = self.next_failure.fetch_add(1, Ordering::SeqCst);
        self.lock_failures()?.push((seq, record.clone()));
        self.journal(Undo::DropFailure(seq));
        Ok(())
    }

    async fn find_for_batch(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<ProcessingFailureRecord>, IngestionError> {
        self.ensure_available()?;
        Ok(self
            .lock_failures()?
            .iter()
            .filter(|(_, r)| &r.batch_id == batch_id)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

/// Last-known bank info, shared by all breaker callers
#[derive(Default)]
pub struct InMemoryBankInfoCache {
    entries: DashMap<BankId, BankInfo>,
}

impl InMemoryBankInfoCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BankInfoCache for InMemoryBankInfoCache {
    async fn get(&self, bank_id: &BankId) -> Result<Option<BankInfo>, IngestionError> {
        Ok(self.entries.get(bank_id).map(|e| e.clone()))
    }

    async fn put(&self, info: &BankInfo) -> Result<(), IngestionError> {
        self.entries.insert(info.bank_id.clone(), info.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::test_support::{t0, uploaded_batch};

    #[tokio::test]
    async fn test_save_is_version_checked() {
        let store = InMemoryBatchStore::new();
        let batch = store.insert(&uploaded_batch("batch_1")).await.unwrap();

        let (parsing, _) = batch.start_processing(t0()).unwrap();
        let saved = store.save(&parsing).await.unwrap();
        assert_eq!(saved.version, 1);

        // a second writer still holding version 0 loses
        let err = store
            .save(&batch.retry_current_step(t0()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestionError::ConcurrentModification {
                expected_version: 0,
                ..
            }
        ));
        assert_eq!(store.get(&batch.batch_id).unwrap().status, BatchStatus::Parsing);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryBatchStore::new();
        store.insert(&uploaded_batch("batch_1")).await.unwrap();
        let err = store.insert(&uploaded_batch("batch_1")).await.unwrap_err();
        assert!(matches!(err, IngestionError::DuplicateBatch(_)));
    }

    #[tokio::test]
    async fn test_find_stuck_filters_and_orders() {
        let store = InMemoryBatchStore::new();
        let old = uploaded_batch("batch_old").start_processing(t0()).unwrap().0;
        let later = t0() + chrono::Duration::minutes(10);
        let newer = uploaded_batch("batch_new")
            .start_processing(later)
            .unwrap()
            .0;
        store.insert(&newer).await.unwrap();
        store.insert(&old).await.unwrap();
        store.insert(&uploaded_batch("batch_uploaded")).await.unwrap();

        let stuck = store
            .find_stuck_batches(
                &BatchStatus::IN_FLIGHT,
                t0() + chrono::Duration::minutes(20),
                10,
            )
            .await
            .unwrap();
        let ids: Vec<_> = stuck.iter().map(|b| b.batch_id.as_str()).collect();
        assert_eq!(ids, vec!["batch_old", "batch_new"]);

        let limited = store
            .find_stuck_batches(&BatchStatus::IN_FLIGHT, later + chrono::Duration::minutes(1), 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let cache = InMemoryBankInfoCache::new();
        assert!(cache.get(&BankId::new("B1")).await.unwrap().is_none());
        cache
            .put(&crate::ingestion::test_support::active_bank("B1", t0()))
            .await
            .unwrap();
        assert!(cache.get(&BankId::new("B1")).await.unwrap().is_some());
    }
}
