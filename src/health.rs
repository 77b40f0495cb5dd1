//! Process health endpoint.
//!
//! A minimal HTTP server exposing `/healthz` for liveness probes and
//! `/metrics` in Prometheus text format, mirrored from the in-process
//! metrics facade on each scrape. Disabled when the configured port
//! is 0.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::Metrics;

struct HealthState {
    registry: Registry,
    gauges: Vec<(&'static str, IntGauge)>,
    metrics: Arc<Metrics>,
}

/// Starts the health server. Returns immediately; the server task
/// stops when the token fires.
pub async fn serve(
    port: u16,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<Option<tokio::task::JoinHandle<()>>> {
    if port == 0 {
        return Ok(None);
    }

    let registry = Registry::new();
    let mut gauges = Vec::new();
    for (name, _) in metrics.counters() {
        let gauge = IntGauge::with_opts(Opts::new(
            format!("skytrail_{name}"),
            format!("skytrail {} counter", name.replace('_', " ")),
        ))
        .context("creating gauge")?;
        registry
            .register(Box::new(gauge.clone()))
            .context("registering gauge")?;
        gauges.push((name, gauge));
    }

    let state = Arc::new(HealthState {
        registry,
        gauges,
        metrics,
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(scrape))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding health endpoint on {addr}"))?;

    info!(%addr, "health endpoint listening");

    let task = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "health server error");
        }
    });

    Ok(Some(task))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn scrape(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let counters = state.metrics.counters();
    for (name, gauge) in &state.gauges {
        if let Some((_, value)) = counters.iter().find(|(k, _)| k == name) {
            gauge.set(*value as i64);
        }
    }

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode error: {e}"),
        );
    }

    match String::from_utf8(buf) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode error: {e}"),
        ),
    }
}
