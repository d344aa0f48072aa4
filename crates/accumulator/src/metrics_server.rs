use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

use crate::supervisor::Health;

/// `/metrics`: a thin Prometheus scrape sink. No core behavior depends on its presence — it
/// only renders whatever the `metrics` facade has recorded.
pub fn build_metrics_router() -> axum::Router<()> {
    let recorder = PrometheusBuilder::new()
        .set_buckets(
            &prometheus::exponential_buckets(0.001, 2.0, 12)
                .expect("calculating histogram buckets"),
        )
        .expect("calculating histogram buckets")
        .install_recorder()
        .expect("failed to install prometheus recorder");

    axum::Router::new()
        .route("/metrics", get(render_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(recorder)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> (StatusCode, String) {
    (StatusCode::OK, handle.render())
}

/// `/healthz`: reports whether every currently-assigned partition has a live worker.
pub fn build_health_router(health: Arc<Health>) -> axum::Router<()> {
    axum::Router::new()
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(health)
}

async fn healthz(State(health): State<Arc<Health>>) -> (StatusCode, String) {
    let active = health.active_workers();
    if active > 0 {
        (StatusCode::OK, format!("{active} partition(s) active"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no active partitions".to_string())
    }
}
