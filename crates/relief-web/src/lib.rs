//! On-demand trigger surface for the ingestion service.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use relief_sync::{GuardPhase, IngestService, TriggerOutcome, TriggerSource};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "relief-web";

pub const DEFAULT_PORT: u16 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestService>,
}

impl AppState {
    pub fn new(service: Arc<IngestService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Serialize)]
struct CrawlStatus {
    #[serde(flatten)]
    phase: GuardPhase,
    checked_at: DateTime<Utc>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/crawl", get(crawl_handler).post(crawl_handler))
        .route("/api/crawl/status", get(crawl_status_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("RELIEF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(
    service: Arc<IngestService>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding trigger surface on port {port}"))?;
    info!(port, "trigger surface listening");
    axum::serve(listener, app(AppState::new(service)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving trigger surface")?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn crawl_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.service.trigger(TriggerSource::OnDemand).await;
    let status = match outcome {
        TriggerOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        TriggerOutcome::Completed { .. } | TriggerOutcome::Skipped { .. } => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

async fn crawl_status_handler(State(state): State<Arc<AppState>>) -> Json<CrawlStatus> {
    Json(CrawlStatus {
        phase: state.service.guard().phase(),
        checked_at: Utc::now(),
    })
}
