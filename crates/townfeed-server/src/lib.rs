//! HTTP invocation surface. Every job trigger goes through the same envelope
//! as the CLI and the scheduler; the envelope's status code is returned as-is.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use townfeed_jobs::schedule::maybe_build_scheduler;
use townfeed_jobs::{runner_from_env, JobKind, JobRunner};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "townfeed-server";

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Clone)]
pub struct AppState {
    pub runner: JobRunner,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListing {
    pub id: &'static str,
    pub description: &'static str,
    pub schedule: Option<String>,
}

pub fn app(runner: JobRunner) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{job}", post(invoke_handler))
        .with_state(Arc::new(AppState { runner }))
}

/// Bind `TOWNFEED_PORT` (default 8080) and serve until ctrl-c. When the scheduler is
/// enabled it runs alongside the HTTP surface and shares its run guards.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TOWNFEED_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let runner = runner_from_env().await?;

    let mut scheduler = maybe_build_scheduler(&runner).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "townfeed server listening");
    axum::serve(listener, app(runner))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler failed; shutting down");
    }
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<JobListing>> {
    let config = &state.runner.context().config;
    Json(
        JobKind::ALL
            .into_iter()
            .map(|job| JobListing {
                id: job.id(),
                description: job.description(),
                schedule: config.cron_for(job).map(str::to_string),
            })
            .collect(),
    )
}

async fn invoke_handler(
    State(state): State<Arc<AppState>>,
    Path(job): Path<String>,
    body: Bytes,
) -> Response {
    let job: JobKind = match job.parse() {
        Ok(job) => job,
        Err(err) => return client_error(StatusCode::NOT_FOUND, err.to_string()),
    };
    let payload = match parse_payload(&body) {
        Ok(payload) => payload,
        Err(message) => return client_error(StatusCode::BAD_REQUEST, message),
    };

    let response = state.runner.invoke(job, payload).await;
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}

/// Empty body means no payload.
fn parse_payload(body: &[u8]) -> Result<JsonValue, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(value @ JsonValue::Object(_)) => Ok(value),
        Ok(_) => Err("payload must be a JSON object".to_string()),
        Err(err) => Err(format!("invalid JSON payload: {err}")),
    }
}

fn client_error(status: StatusCode, error: String) -> Response {
    (status, Json(json!({"success": false, "error": error}))).into_response()
}
