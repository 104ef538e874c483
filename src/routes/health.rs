use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub cancel_channel: ComponentHealth,
    pub worker_pool: PoolHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<&'static str>,
}

#[derive(Serialize)]
pub struct PoolHealth {
    pub status: String,
    pub in_flight: usize,
}

fn component<E>(result: Result<(), E>, start: std::time::Instant) -> ComponentHealth {
    match result {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            backend: None,
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
            backend: None,
        },
    }
}

/// GET /health: store, cancel channel and worker pool status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let engine = &state.engine;

    let start = std::time::Instant::now();
    let database = component(engine.tasks.ping().await, start);

    let start = std::time::Instant::now();
    let cancel_channel = ComponentHealth {
        backend: Some(engine.signal.backend()),
        ..component(engine.signal.health_check().await, start)
    };

    let worker_pool = PoolHealth {
        status: if engine.pool.is_alive() { "ok" } else { "error" }.to_string(),
        in_flight: engine.pool.in_flight(),
    };

    // A dead pool is restarted by the reaper, so it degrades but does not fail the check.
    let healthy = database.status == "ok" && cancel_channel.status == "ok";
    let degraded = healthy && worker_pool.status != "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: match (healthy, degraded) {
            (true, false) => "ok",
            _ => "degraded",
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database,
            cancel_channel,
            worker_pool,
        },
    };

    (status_code, Json(response))
}
