use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod auth;
pub mod health;
pub mod metrics;
pub mod tasks;

/// Request bodies carry at most an inline reference image plus JSON overhead.
const BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let metrics_handle = state.metrics.clone();

    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/tasks", post(tasks::submit_task))
        .route("/api/v1/tasks/{task_id}", get(tasks::get_task))
        .route("/api/v1/tasks/{task_id}/cancel", post(tasks::cancel_task))
        .route("/api/v1/tasks/{task_id}/logs", get(tasks::task_logs))
        .route("/api/v1/credits", get(tasks::get_credits))
        .with_state(state);

    if let Some(handle) = metrics_handle {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
}
