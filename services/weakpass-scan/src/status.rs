//! Status endpoint
//!
//! `/health` reports scan progress and proxy pool health as JSON. It returns
//! 503 once every proxy is cooling down, so an orchestrator can tell a stalled
//! scan from a slow one. `/metrics` serves the Prometheus text format.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use proxy_pool::ProxyPool;

/// Progress of the running session, shared with the batch callbacks.
pub struct Progress {
    session_id: String,
    done: AtomicUsize,
    total: AtomicUsize,
    finished: AtomicBool,
    started_at: Instant,
}

impl Progress {
    pub fn new(session_id: impl Into<String>, done: usize, total: usize) -> Self {
        Self {
            session_id: session_id.into(),
            done: AtomicUsize::new(done),
            total: AtomicUsize::new(total),
            finished: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn update(&self, done: usize, total: usize) {
        self.done.store(done, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.done.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub progress: Arc<Progress>,
    pub pool: Arc<ProxyPool>,
    pub prometheus: PrometheusHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (done, total) = state.progress.snapshot();
    let finished = state.progress.finished.load(Ordering::Relaxed);
    let pool = state.pool.health().await;

    let status_code = if pool["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let completion_rate = if total == 0 {
        0.0
    } else {
        done as f64 / total as f64
    };

    let body = serde_json::json!({
        "status": if finished { "finished" } else { "scanning" },
        "session_id": state.progress.session_id,
        "completed_targets": done,
        "total_targets": total,
        "completion_rate": completion_rate,
        "uptime_seconds": state.progress.started_at.elapsed().as_secs(),
        "proxy_pool": pool,
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
