use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::actuator::{Actuator, ActuatorController};
use crate::error::TriggerError;
use crate::hardware::RelayPort;
use crate::state::SharedState;
use crate::telemetry::TelemetryLog;

const DEFAULT_READINGS_LIMIT: usize = 60;
const MAX_READINGS_LIMIT: usize = 5000;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub actuators: ActuatorController,
    pub relays: Arc<dyn RelayPort>,
    pub log: Arc<TelemetryLog>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/readings", get(api_readings))
        .route("/api/actuators/{name}/trigger", post(api_trigger))
        .route("/api/actuators/{name}/abort", post(api_abort))
        .with_state(app)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let relays = app.relays.states();
    let jobs = app.actuators.active();
    let st = app.shared.read().await;
    Json(st.to_status(relays, jobs))
}

#[derive(Deserialize)]
struct ReadingsQuery {
    limit: Option<usize>,
}

async fn api_readings(
    State(app): State<AppState>,
    Query(q): Query<ReadingsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .min(MAX_READINGS_LIMIT);
    let log = Arc::clone(&app.log);
    let rows = tokio::task::spawn_blocking(move || log.tail(limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(rows))
}

/// `duration` may be sent as a JSON string or number; both go through the
/// same validation.
#[derive(Deserialize)]
struct TriggerRequest {
    duration: Value,
}

async fn api_trigger(
    State(app): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<TriggerRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let actuator: Actuator = name.parse().map_err(ApiError::NotFound)?;
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let raw = match req.duration {
        Value::String(s) => s,
        other => other.to_string(),
    };

    let job = app.actuators.trigger(actuator, &raw)?;
    info!(%actuator, hold_sec = job.hold.as_secs(), "manual trigger accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "actuator": actuator,
            "duration_sec": job.hold.as_secs(),
            "status": "started",
        })),
    ))
}

async fn api_abort(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let actuator: Actuator = name.parse().map_err(ApiError::NotFound)?;
    let aborted = app.actuators.abort(actuator);
    if aborted {
        info!(%actuator, "manual abort");
    }
    Ok(Json(json!({ "aborted": aborted })))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Trigger(TriggerError),
    Internal(String),
}

impl From<TriggerError> for ApiError {
    fn from(e: TriggerError) -> Self {
        ApiError::Trigger(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Trigger(e) => {
                let status = match e {
                    TriggerError::InvalidDuration { .. } => StatusCode::BAD_REQUEST,
                    TriggerError::Busy(_) => StatusCode::CONFLICT,
                    TriggerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                };
                warn!(status = status.as_u16(), "trigger rejected: {e}");
                (status, e.to_string())
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    app: AppState,
    bind: &str,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ip = bind
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let addr = SocketAddr::new(ip, port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
