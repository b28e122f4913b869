//! # Server — Health, Readiness, and Metrics Endpoints
//!
//! | Endpoint | Purpose |
//! |----------|---------|
//! | `GET /healthz` | Liveness: the process is serving HTTP |
//! | `GET /readyz` | Aggregated health probes; 503 unless healthy or degraded |
//! | `GET /metrics` | Prometheus text exposition |
//! | `GET /events` | Recent task lifecycle events, newest first |
//!
//! Probes are synchronous and cheap (gauge reads and a disk listing), so `/readyz`
//! runs them inline on every request.

use crate::telemetry::Telemetry;
use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub telemetry: Arc<Telemetry>,
}

pub fn router(telemetry: Arc<Telemetry>) -> Router {
    Router::new()
        .route("/healthz", get(handler_healthz))
        .route("/readyz", get(handler_readyz))
        .route("/metrics", get(handler_metrics))
        .route("/events", get(handler_events))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(10),
        ))
        .with_state(AppState { telemetry })
}

async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn handler_readyz(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.telemetry.health.run_all();
    let code = if health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health.to_json()))
}

async fn handler_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.telemetry.metrics.encode();
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn handler_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(state.telemetry.events.recent_events(limit))
}

/// Serve until `shutdown` flips to true.
pub async fn serve(
    addr: SocketAddr,
    telemetry: Arc<Telemetry>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");
    axum::serve(listener, router(telemetry))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    info!("health server stopped");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
