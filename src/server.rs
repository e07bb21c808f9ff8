//! HTTP surface: webhook ingestion, run-batch triggers, and the dashboard
//! snapshot.
//!
//! Handlers open their own database connection per request and do all
//! SQLite work on the blocking pool. WAL mode plus the busy timeout makes
//! concurrent short-lived connections safe.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use crate::config::Config;
use crate::db::SyncDb;
use crate::error::ProcessingError;
use crate::hooks::notifier_from_config;
use crate::ingest::{ingest_envelope, IngestOutcome};
use crate::metrics::sla_snapshot;
use crate::processors::ProcessorRegistry;
use crate::queue_manager::{run_batch, RunOptions};
use crate::types::{QueueType, WebhookEnvelope};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db_path: Arc<PathBuf>,
    pub registry: Arc<ProcessorRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks", post(receive_webhook))
        .route("/run/:queue_type", post(trigger_run))
        .route("/dashboard", get(dashboard))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(
    config: Config,
    db_path: PathBuf,
    registry: ProcessorRegistry,
) -> Result<(), String> {
    let bind = config.bind.clone();
    let state = AppState {
        config: Arc::new(config),
        db_path: Arc::new(db_path),
        registry: Arc::new(registry),
    };

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", bind, e))?;
    log::info!("Server: listening on {}", bind);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| format!("Server error: {}", e))
}

/// Accept one webhook envelope. Fire-and-forget: the caller learns only
/// accepted-or-rejected, never the processing outcome.
async fn receive_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<WebhookEnvelope>,
) -> Response {
    let result = tokio::task::spawn_blocking(move || -> Result<_, ProcessingError> {
        let db = SyncDb::open_at(&state.db_path)?;
        let (outcome, queue_type) = ingest_envelope(&db, &envelope, state.config.max_attempts)?;
        Ok((outcome, queue_type, envelope.event_id))
    })
    .await;

    match result {
        Ok(Ok((outcome, queue_type, event_id))) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "accepted": true,
                "eventId": event_id,
                "queueType": queue_type.as_str(),
                "duplicate": outcome == IngestOutcome::Duplicate,
            })),
        )
            .into_response(),
        Ok(Err(ProcessingError::Validation(message))) => {
            error_response(StatusCode::BAD_REQUEST, &message)
        }
        Ok(Err(e)) => {
            log::error!("Server: ingest failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "ingestion failed")
        }
        Err(e) => {
            log::error!("Server: ingest task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "ingestion failed")
        }
    }
}

/// Run one bounded batch for one queue type. Driven by an external
/// scheduler, guarded by the shared run secret.
async fn trigger_run(
    State(state): State<AppState>,
    UrlPath(queue): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state.config.run_secret, &headers) {
        return error_response(StatusCode::FORBIDDEN, "invalid run secret");
    }
    let Some(queue_type) = QueueType::parse(&queue) else {
        return error_response(StatusCode::BAD_REQUEST, "unknown queue type");
    };

    let result = tokio::task::spawn_blocking(move || {
        let db = SyncDb::open_at(&state.db_path)?;
        let notifier = notifier_from_config(&state.config);
        run_batch(
            &db,
            &state.registry,
            notifier.as_ref(),
            queue_type,
            &RunOptions::from_config(&state.config),
        )
    })
    .await;

    match result {
        Ok(Ok(summary)) => (StatusCode::OK, Json(summary)).into_response(),
        Ok(Err(e)) => {
            log::error!("Server: {} run failed: {}", queue_type.as_str(), e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "run failed")
        }
        Err(e) => {
            log::error!("Server: run task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "run failed")
        }
    }
}

/// Current per-queue health rollup.
async fn dashboard(State(state): State<AppState>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let db = SyncDb::open_at(&state.db_path)?;
        sla_snapshot(&db, &state.config, Utc::now())
    })
    .await;

    match result {
        Ok(Ok(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(Err(e)) => {
            log::error!("Server: dashboard snapshot failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "snapshot failed")
        }
        Err(e) => {
            log::error!("Server: dashboard task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "snapshot failed")
        }
    }
}

async fn health() -> Response {
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")})),
    )
        .into_response()
}

/// An empty configured secret leaves the trigger endpoint open, for local
/// development only.
fn authorized(secret: &str, headers: &HeaderMap) -> bool {
    if secret.is_empty() {
        return true;
    }
    headers
        .get("x-run-secret")
        .and_then(|value| value.to_str().ok())
        .map(|value| value == secret)
        .unwrap_or(false)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
