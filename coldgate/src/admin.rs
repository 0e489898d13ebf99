//! Operator HTTP API plus health, readiness and metrics endpoints.
//!
//! A thin adapter over [`IngestEngine`]'s admin methods; it holds no state
//! of its own.

use crate::error::{PersistenceError, QueryError};
use crate::ingest::IngestEngine;
use crate::store::Record;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<IngestEngine>,
    pub ready: watch::Receiver<bool>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<PersistenceError> for ApiError {
    fn from(e: PersistenceError) -> Self {
        error!("Admin request failed: {}", e);
        ApiError::Internal(e.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidDevice(e) => ApiError::BadRequest(e.to_string()),
            QueryError::Persistence(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CommandQueued {
    pub device_id: String,
    pub command: String,
    pub replaced: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct AlarmStateView {
    pub device_id: String,
    /// `None` when the device has no active alarm
    pub alarm_codes: Option<Vec<i64>>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub reports: u64,
}

pub fn router(state: AdminState) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id/records", get(get_records))
        .route("/api/devices/:id/alarms", get(get_alarm_state))
        .route("/api/devices/:id/command", post(queue_command));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router.with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ready_handler(State(state): State<AdminState>) -> (StatusCode, &'static str) {
    if *state.ready.borrow() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    crate::metrics::render()
}

pub async fn list_devices(State(state): State<AdminState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.engine.list_devices().await?))
}

pub async fn get_records(
    State(state): State<AdminState>,
    Path(device_id): Path<String>,
) -> Result<Json<Vec<Record>>, ApiError> {
    Ok(Json(state.engine.get_records(&device_id).await?))
}

pub async fn get_alarm_state(
    State(state): State<AdminState>,
    Path(device_id): Path<String>,
) -> Json<AlarmStateView> {
    let view = match state.engine.alarm_entry(&device_id) {
        Some(entry) => AlarmStateView {
            alarm_codes: Some(entry.codes.into_iter().collect()),
            first_seen: Some(entry.first_seen),
            last_seen: Some(entry.last_seen),
            reports: entry.count,
            device_id,
        },
        None => AlarmStateView {
            device_id,
            alarm_codes: None,
            first_seen: None,
            last_seen: None,
            reports: 0,
        },
    };
    Json(view)
}

pub async fn queue_command(
    State(state): State<AdminState>,
    Path(device_id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandQueued>, ApiError> {
    let command = req
        .command
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("command must be a non-empty string".to_string()))?;

    let replaced = state
        .engine
        .queue_command(&device_id, &command)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(Json(CommandQueued {
        device_id,
        command,
        replaced,
    }))
}

/// Serve the admin API until `shutdown` flips to true.
pub async fn serve(addr: SocketAddr, state: AdminState, mut shutdown: watch::Receiver<bool>) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind admin server to {}: {}", addr, e);
            return;
        }
    };
    info!("Admin server listening on {}", addr);

    let app = router(state);
    let stop = async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    };

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
        error!("Admin server error: {}", e);
    }
}
