use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use imagegen_tasks::app_state::AppState;
use imagegen_tasks::config::AppConfig;
use imagegen_tasks::db::{self, PgLedgerStore, PgTaskStore};
use imagegen_tasks::engine::{Engine, EngineDeps};
use imagegen_tasks::routes::{self, auth::JwtKeys};
use imagegen_tasks::services::materializer::HttpFetcher;
use imagegen_tasks::services::provider::ImageApiClient;
use imagegen_tasks::services::signal::{CancelSignal, LocalCancelSignal, RedisCancelSignal};
use imagegen_tasks::services::storage::R2Client;

/// Cancel notices outlive any task that can still be running.
const CANCEL_NOTICE_TTL_SECS: u64 = 24 * 60 * 60;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let settings = config.engine_settings();

    tracing::info!("Initializing imagegen-tasks server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    routes::metrics::describe();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let admin_pool = db::init_pool(config.admin_database_url())
        .await
        .expect("Failed to connect to database with admin credentials");

    tracing::info!("Running database migrations");
    db::run_migrations(&admin_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing R2 storage client");
    let storage = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
        &config.r2_public_url,
    )
    .expect("Failed to initialize R2 client");

    let provider = ImageApiClient::new(
        &config.provider_base_url,
        &config.provider_api_key,
        &config.provider_chat_model,
        &config.provider_image_model,
    )
    .expect("Failed to initialize provider client");

    let fetcher = HttpFetcher::new(Duration::from_secs(60), settings.limits.max_reference_image_bytes * 4)
        .expect("Failed to initialize result fetcher");

    let signal: Arc<dyn CancelSignal> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisCancelSignal::new(url, CANCEL_NOTICE_TTL_SECS)
                .expect("Failed to initialize Redis cancel channel"),
        ),
        None => Arc::new(LocalCancelSignal::default()),
    };
    tracing::info!(backend = signal.backend(), "Cancel channel ready");

    let engine = Engine::new(EngineDeps {
        tasks: Arc::new(PgTaskStore::new(db_pool.clone())),
        admin_tasks: Arc::new(PgTaskStore::new(admin_pool)),
        ledger_store: Arc::new(PgLedgerStore::new(db_pool)),
        provider: Arc::new(provider),
        storage: Arc::new(storage),
        fetcher: Arc::new(fetcher),
        signal,
        settings,
    });

    let (shutdown, shutdown_rx) = watch::channel(false);
    let background = engine.start(config.embedded_sweeps, shutdown_rx);

    let state = AppState::new(engine, JwtKeys::new(&config.jwt_secret), Some(prometheus_handle));
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .expect("Server error");

    let _ = shutdown.send(true);
    for handle in background {
        let _ = handle.await;
    }
}
