use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder (once per process) and serve `/metrics`.
pub async fn init(bind_addr: &str) -> anyhow::Result<JoinHandle<()>> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics bind address '{bind_addr}': {e}"))?;

    let handle = PROM_HANDLE
        .get_or_try_init(|| PrometheusBuilder::new().install_recorder())
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus metrics recorder: {e}"))?
        .clone();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics endpoint listening");

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(handle);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(error = %e, "metrics server error");
        }
    }))
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
