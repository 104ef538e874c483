use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the engine's metrics.
pub fn describe() {
    metrics::describe_counter!("tasks_submitted_total", "Tasks created by submission");
    metrics::describe_counter!("tasks_completed_total", "Tasks that reached completed");
    metrics::describe_counter!("tasks_failed_total", "Tasks failed by the executor, by error kind");
    metrics::describe_counter!("tasks_cancelled_total", "Tasks cancelled by clients");
    metrics::describe_counter!("tasks_reaped_total", "Stuck tasks terminated by the reaper");
    metrics::describe_counter!(
        "tasks_lost_race_total",
        "Generation results discarded because the task was already terminal"
    );
    metrics::describe_counter!(
        "credit_anomalies_total",
        "Ledger operations that did not go as expected, by kind"
    );
    metrics::describe_counter!("results_materialized_total", "Results re-hosted in object storage");
    metrics::describe_counter!("worker_pool_restarts_total", "Worker pool restarts by the reaper");
    metrics::describe_gauge!("worker_pool_in_flight", "Executor runs in progress");
    metrics::describe_histogram!(
        "generation_duration_seconds",
        "Wall time of one provider attempt"
    );
}
