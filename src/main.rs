//! RegTech Ingestion - batch ingestion service
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Upload  │───▶│  Parse   │───▶│  Enrich  │───▶│  Store   │
//! │          │    │(Validate)│    │(Registry)│    │ (Object) │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//!                       ▲  Recovery worker resumes stuck batches
//! ```
//!
//! Modes:
//! - `--recovery-worker` (default): run the background recovery loop
//! - `--recover-once`: run a single recovery pass and exit
//! - `--status <batch_id>`: print the recovery view of one batch
//! - `--health`: check the batch store, registry breaker and storage
//! - `--ingest <file> --bank <bank_id>`: upload and process one file

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};

use regtech_ingestion::adapters::postgres::SCHEMA;
use regtech_ingestion::adapters::{
    HttpBankRegistryClient, InMemoryBankInfoCache, InMemoryBatchStore, JsonExposureParser,
    JsonExposureValidator, LocalObjectStorage, PgBankInfoCache, PgStore, TracingEventPublisher,
};
use regtech_ingestion::config::AppConfig;
use regtech_ingestion::db::Database;
use regtech_ingestion::ingestion::{
    BankId, BankInfoCache, BankRegistryCircuitBreaker, BatchId, BatchPipeline, BatchRepository,
    FailureRecordRepository, FileMetadata, PipelinePorts, RecoveryService, RecoveryWorker,
    StorageService, TransactionCoordinator, TransactionManager,
};

fn get_env() -> String {
    get_arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_arg_value(flags: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if flags.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|a| a == flag)
}

/// Store-side ports, backed by PostgreSQL or memory
struct Stores {
    manager: Arc<dyn TransactionManager>,
    batches: Arc<dyn BatchRepository>,
    failures: Arc<dyn FailureRecordRepository>,
    cache: Arc<dyn BankInfoCache>,
}

async fn build_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url, config.postgres_max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.ensure_schema(SCHEMA)
                .await
                .context("Failed to apply schema")?;
            let store = Arc::new(PgStore::new(db.pool().clone()));
            Ok(Stores {
                manager: store.clone(),
                batches: store.clone(),
                failures: store,
                cache: Arc::new(PgBankInfoCache::new(db.pool().clone())),
            })
        }
        None => {
            tracing::warn!("postgres_url not set, batches are kept in memory only");
            let store = Arc::new(InMemoryBatchStore::new());
            Ok(Stores {
                manager: store.clone(),
                batches: store.clone(),
                failures: store,
                cache: Arc::new(InMemoryBankInfoCache::new()),
            })
        }
    }
}

struct Services {
    pipeline: BatchPipeline,
    recovery: Arc<RecoveryService>,
    transactions: Arc<TransactionCoordinator>,
    breaker: Arc<BankRegistryCircuitBreaker>,
    storage: Arc<dyn StorageService>,
}

async fn build_services(config: &AppConfig) -> anyhow::Result<Services> {
    let ingestion = &config.ingestion;
    let clock: Arc<dyn mockable::Clock> = Arc::new(mockable::DefaultClock);
    let stores = build_stores(config).await?;

    let transactions = Arc::new(TransactionCoordinator::new(
        stores.manager,
        stores.batches.clone(),
        clock.clone(),
        ingestion.transaction.clone(),
    ));
    let registry = HttpBankRegistryClient::new(
        ingestion.bank_registry.base_url.clone(),
        ingestion.bank_registry.call_timeout(),
    )
    .context("Failed to build bank registry client")?;
    let breaker = Arc::new(
        BankRegistryCircuitBreaker::new(
            Arc::new(registry),
            stores.cache,
            clock.clone(),
            ingestion.circuit_breaker.clone(),
        )
        .with_call_timeout(ingestion.bank_registry.call_timeout()),
    );
    let storage: Arc<dyn StorageService> = Arc::new(LocalObjectStorage::new(
        &ingestion.storage.root_dir,
        ingestion.storage.bucket.clone(),
    ));
    let publisher = Arc::new(TracingEventPublisher);

    let pipeline = BatchPipeline::new(
        PipelinePorts {
            batches: stores.batches.clone(),
            transactions: transactions.clone(),
            bank_registry: breaker.clone(),
            storage: storage.clone(),
            parser: Arc::new(JsonExposureParser::default()),
            validator: Arc::new(JsonExposureValidator),
            failures: stores.failures,
            publisher: publisher.clone(),
        },
        clock.clone(),
    );
    let recovery = Arc::new(RecoveryService::new(
        stores.batches,
        transactions.clone(),
        publisher,
        clock,
        ingestion.recovery.clone(),
    ));

    Ok(Services {
        pipeline,
        recovery,
        transactions,
        breaker,
        storage,
    })
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

async fn run_ingest(services: &Services, file: &str, bank: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", file))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Input path has no file name")?;
    let metadata = FileMetadata::for_content(file_name, content_type_for(path), &content);

    let batch = services
        .pipeline
        .upload(BankId::new(bank), metadata, None)
        .await?;
    println!("📥 Uploaded {} as {}", file, batch.batch_id);

    match services.pipeline.process(&batch.batch_id, &content).await {
        Ok(done) => {
            println!(
                "✅ {} completed: {} exposures stored at {}",
                done.batch_id,
                done.total_exposures.unwrap_or(0),
                done.s3_reference
                    .as_ref()
                    .map(|r| r.uri.as_str())
                    .unwrap_or("-")
            );
            Ok(())
        }
        Err(e) => {
            let status = services
                .recovery
                .get_recovery_status(&batch.batch_id)
                .await?;
            println!("❌ {} failed: {}", batch.batch_id, e);
            for recommendation in &status.recommendations {
                println!("   - {}", recommendation);
            }
            bail!("ingestion failed with {}", e.code())
        }
    }
}

async fn run_status(services: &Services, batch_id: &str) -> anyhow::Result<()> {
    let status = services
        .recovery
        .get_recovery_status(&BatchId::new(batch_id))
        .await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_health(services: &Services) -> anyhow::Result<()> {
    let tx = services.transactions.check_health().await;
    let breaker = services.breaker.metrics();
    let storage_ok = services.storage.check_health().await;

    println!(
        "Transactions:  {} ({}, {} batches)",
        if tx.is_healthy { "UP" } else { "DOWN" },
        tx.status_message,
        tx.batch_count
    );
    println!(
        "Bank registry: {} (state {}, {} failures)",
        breaker.health_status(),
        breaker.state,
        breaker.failure_count
    );
    println!("Storage:       {}", if storage_ok { "UP" } else { "DOWN" });

    if !tx.is_healthy || !storage_ok {
        bail!("service unhealthy");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = regtech_ingestion::logging::init_logging(&app_config);

    tracing::info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        "Starting RegTech ingestion"
    );

    let services = build_services(&app_config).await?;

    if has_flag("--health") {
        return run_health(&services).await;
    }
    if let Some(batch_id) = get_arg_value(&["--status"]) {
        return run_status(&services, &batch_id).await;
    }
    if let Some(file) = get_arg_value(&["--ingest"]) {
        let Some(bank) = get_arg_value(&["--bank"]) else {
            bail!("--ingest requires --bank <bank_id>");
        };
        return run_ingest(&services, &file, &bank).await;
    }

    let worker = Arc::new(RecoveryWorker::with_defaults(services.recovery.clone()));
    if has_flag("--recover-once") {
        let report = worker.scan_and_recover().await?;
        println!(
            "Recovery pass: {} scanned, {} recovered, {} failed",
            report.scanned,
            report.recovered.len(),
            report.errors.len()
        );
        for failure in &report.errors {
            println!("   - {}: {}", failure.batch_id, failure.error);
        }
        return Ok(());
    }

    // --recovery-worker is the default mode
    let worker_clone = worker.clone();
    tokio::spawn(async move {
        worker_clone.run().await;
    });

    println!("🔄 Recovery worker running in background...");
    println!("   Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, stopping");
    Ok(())
}
