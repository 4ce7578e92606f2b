//! Test doubles shared by the ingestion unit and integration tests

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;

use super::batch::IngestionBatch;
use super::error::IngestionError;
use super::events::BatchEvent;
use super::failure::FailureCategory;
use super::ports::{BankRegistryClient, EventPublisher, StorageService};
use super::types::{BankId, BankInfo, BankStatus, BatchId, FileMetadata, S3Reference};

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn active_bank(id: &str, now: DateTime<Utc>) -> BankInfo {
    BankInfo::new(BankId::new(id), "Banca Uno", "IT", BankStatus::Active, now)
}

pub fn uploaded_batch(id: &str) -> IngestionBatch {
    IngestionBatch::new(
        BatchId::new(id),
        BankId::new("B1"),
        FileMetadata::for_content("loans.json", "application/json", b"[]"),
        t0(),
    )
}

pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn fixed() -> Self {
        Self::new(t0())
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.0.lock().unwrap() += delta;
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

enum RegistryBehavior {
    Respond(BankInfo),
    Fail(FailureCategory),
    NotFound,
}

pub struct MockRegistry {
    behavior: Mutex<RegistryBehavior>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(RegistryBehavior::Fail(FailureCategory::Unavailable)),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn respond_with(&self, info: BankInfo) {
        *self.behavior.lock().unwrap() = RegistryBehavior::Respond(info);
    }

    pub fn fail_with(&self, category: FailureCategory) {
        *self.behavior.lock().unwrap() = RegistryBehavior::Fail(category);
    }

    pub fn not_found(&self) {
        *self.behavior.lock().unwrap() = RegistryBehavior::NotFound;
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BankRegistryClient for MockRegistry {
    async fn fetch(&self, bank_id: &BankId) -> Result<BankInfo, IngestionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match &*self.behavior.lock().unwrap() {
            RegistryBehavior::Respond(info) => Ok(info.clone()),
            RegistryBehavior::Fail(category) => Err(IngestionError::dependency(
                "bank-registry",
                *category,
                "registry call failed",
            )),
            RegistryBehavior::NotFound => Err(IngestionError::BankNotFound(bank_id.clone())),
        }
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<BatchEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(BatchEvent::name).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &BatchEvent) -> Result<(), IngestionError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockStorage {
    fail: AtomicBool,
    stored: Mutex<Vec<S3Reference>>,
    deleted: Mutex<Vec<S3Reference>>,
}

impl MockStorage {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn store_calls(&self) -> usize {
        self.stored.lock().unwrap().len()
    }

    pub fn deleted(&self) -> Vec<S3Reference> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageService for MockStorage {
    async fn store_file(
        &self,
        _content: &[u8],
        metadata: &FileMetadata,
        batch_id: &BatchId,
        bank_id: &BankId,
        _exposure_count: u64,
    ) -> Result<S3Reference, IngestionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(IngestionError::dependency(
                "storage",
                FailureCategory::Unavailable,
                "service unavailable",
            ));
        }
        let reference = S3Reference::new(
            "test-bucket",
            format!("raw/{}/{}/{}", bank_id, batch_id, metadata.file_name),
        );
        self.stored.lock().unwrap().push(reference.clone());
        Ok(reference)
    }

    async fn check_health(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }

    async fn delete_file(&self, reference: &S3Reference) -> Result<(), IngestionError> {
        self.deleted.lock().unwrap().push(reference.clone());
        Ok(())
    }
}
