//! LedgerForge Ingestion Worker
//!
//! Runs the document pipeline against the configured database:
//! 1. Resumes items left idle by a previous run
//! 2. Drives queued items through the stages with a worker pool
//! 3. Periodically reconciles items stuck mid-stage
//! 4. Exposes Prometheus metrics

use anyhow::Context;
use ledgerforge_common::{config::AppConfig, db::migrations, db::DbPool, metrics, Repository, VERSION};
use ledgerforge_ingestion::insights::LearningInsights;
use ledgerforge_ingestion::ocr::{HttpOcrClient, RoutingExtractor, TextExtractor};
use ledgerforge_ingestion::worker::spawn_reconciler;
use ledgerforge_ingestion::{ComponentRegistry, IngestionService, Pipeline, WorkerPool};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Items requeued at startup
const RESUME_LIMIT: u64 = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Arc::new(AppConfig::load().context("failed to load configuration")?);

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting LedgerForge Ingestion v{}", VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Metrics listening on {}", addr);
    }
    metrics::register_metrics();

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database)
        .await
        .context("failed to connect to database")?;
    if config.database.auto_migrate {
        migrations::ensure_schema(&db)
            .await
            .context("failed to create schema")?;
    }
    let repository = Arc::new(Repository::new(db));

    // Text extraction: embedded PDF text, OCR engine when configured
    let ocr = HttpOcrClient::from_config(&config.ocr)?.map(|c| Arc::new(c) as Arc<dyn TextExtractor>);
    if ocr.is_none() {
        info!("No OCR engine configured, scanned documents will fail extraction");
    }
    let extractor = Arc::new(RoutingExtractor::new(ocr));

    let insights = LearningInsights::new(repository.clone());
    let registry = ComponentRegistry::with_defaults(&config, Some(insights));
    let pipeline = Arc::new(Pipeline::new(
        repository.clone(),
        repository.clone(),
        extractor,
        registry,
        &config,
    ));

    let pool = WorkerPool::start(
        pipeline.clone(),
        config.pipeline.workers,
        config.pipeline.queue_capacity,
    );
    let reconciler = spawn_reconciler(
        pipeline.clone(),
        pool.queue(),
        Duration::from_secs(config.pipeline.reconcile_interval_secs),
        Duration::from_secs(config.pipeline.stuck_after_secs),
        pool.shutdown_signal(),
    );

    let service = IngestionService::new(pipeline, repository)
        .with_queue(pool.queue())
        .with_concurrency(config.pipeline.workers);
    let resumed = service.resume(RESUME_LIMIT).await?;
    info!(resumed, "Ingestion worker ready");

    shutdown_signal().await;

    pool.shutdown().await;
    reconciler.await?;

    info!("Ingestion worker shut down");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
