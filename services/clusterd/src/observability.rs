//! Observability wiring for the cluster service.
//!
//! # Purpose
//! Initializes tracing and the Prometheus recorder, and serves `/metrics`
//! alongside the `/live` and `/ready` probes.
//!
//! # Notes
//! Initialization is guarded by `OnceLock` to keep startup idempotent in tests.
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use felix_cluster::ClusterRegistry;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static OBS_INIT: OnceLock<()> = OnceLock::new();

pub fn init_observability(service_name: &str) -> anyhow::Result<PrometheusHandle> {
    OBS_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer();
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    });
    let handle = install_metrics_recorder()?;
    tracing::debug!(service = service_name, "observability initialized");
    Ok(handle)
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle.clone());
    Ok(handle)
}

#[derive(Clone)]
struct HttpState {
    metrics: PrometheusHandle,
    registry: Arc<ClusterRegistry>,
}

pub fn router(metrics: PrometheusHandle, registry: Arc<ClusterRegistry>) -> axum::Router {
    axum::Router::new()
        .route("/metrics", get(render_metrics))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .with_state(HttpState { metrics, registry })
}

async fn render_metrics(State(state): State<HttpState>) -> String {
    state.metrics.render()
}

async fn ready(State(state): State<HttpState>) -> (StatusCode, &'static str) {
    if state.registry.is_initialized() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "initializing")
    }
}

pub async fn serve_http_with_listener<F>(
    metrics: PrometheusHandle,
    registry: Arc<ClusterRegistry>,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(metrics, registry);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}
