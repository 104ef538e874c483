use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::engine::Engine;
use crate::routes::auth::JwtKeys;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub jwt: Arc<JwtKeys>,
    /// Absent when no recorder is installed (tests).
    pub metrics: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    pub fn new(engine: Engine, jwt: JwtKeys, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            engine,
            jwt: Arc::new(jwt),
            metrics: metrics.map(Arc::new),
        }
    }
}
