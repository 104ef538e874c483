//! Standalone reaper and materialization sweeps with privileged credentials.
//!
//! Runs both loops until interrupted, or a single pass of each with `--once`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use imagegen_tasks::config::AppConfig;
use imagegen_tasks::db::{self, PgLedgerStore, PgTaskStore, TaskStore};
use imagegen_tasks::services::ledger::CreditLedger;
use imagegen_tasks::services::materializer::{HttpFetcher, Materializer};
use imagegen_tasks::services::reaper::Reaper;
use imagegen_tasks::services::signal::{CancelSignal, LocalCancelSignal, RedisCancelSignal};
use imagegen_tasks::services::storage::R2Client;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let once = std::env::args().any(|arg| arg == "--once");
    tracing::info!(once, "Starting sweeper");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let settings = config.engine_settings();

    tracing::info!("Connecting to PostgreSQL with admin credentials");
    let admin_pool = db::init_pool(config.admin_database_url())
        .await
        .expect("Failed to connect to database");

    let tasks: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(admin_pool.clone()));
    let ledger = Arc::new(CreditLedger::new(
        tasks.clone(),
        Arc::new(PgLedgerStore::new(admin_pool)),
        settings.credit_cost,
    ));

    // Without Redis this process cannot see cancel notices from the API server.
    let signal: Arc<dyn CancelSignal> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisCancelSignal::new(url, 24 * 60 * 60).expect("Failed to initialize Redis cancel channel"),
        ),
        None => {
            tracing::warn!("REDIS_URL not set, reaper will not see cancel notices");
            Arc::new(LocalCancelSignal::default())
        }
    };
    tracing::info!(backend = signal.backend(), "Cancel channel ready");

    let storage = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
        &config.r2_public_url,
    )
    .expect("Failed to initialize R2 client");
    let fetcher = HttpFetcher::new(Duration::from_secs(60), settings.limits.max_reference_image_bytes * 4)
        .expect("Failed to initialize result fetcher");

    let reaper = Arc::new(Reaper::new(
        tasks.clone(),
        ledger,
        signal,
        None,
        settings.stuck_after,
    ));
    let materializer = Arc::new(Materializer::new(
        tasks,
        Arc::new(storage),
        Arc::new(fetcher),
        settings.materialize_batch_limit,
        settings.materialize_concurrency,
    ));

    if once {
        match reaper.sweep().await {
            Ok(report) => tracing::info!(?report, "Reaper pass complete"),
            Err(e) => tracing::error!(error = %e, "Reaper pass failed"),
        }
        match materializer.sweep().await {
            Ok(report) => tracing::info!(?report, "Materializer pass complete"),
            Err(e) => tracing::error!(error = %e, "Materializer pass failed"),
        }
        return;
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handles = [
        reaper.spawn(settings.reaper_interval, shutdown_rx.clone()),
        materializer.spawn(settings.materialize_interval, shutdown_rx),
    ];

    tracing::info!("Sweeper ready");
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown requested");
    let _ = shutdown.send(true);
    for handle in handles {
        let _ = handle.await;
    }
}
