// HTTP control surface
//
// Thin command layer over the session runner: connect/disconnect the
// device, start/stop the stream, run calibration, query status, discover
// units, and manage the event recording. Every response is a
// {"status": ...} body; misuse maps to 400, internal faults to 500.

use crate::config::BridgeConfig;
use crate::device::{discovery, DeviceConfig};
use crate::recorder::EventRecorder;
use crate::runner::{RunnerStatus, SessionRunner};
use crate::types::BridgeError;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Shared application state
#[derive(Clone)]
pub struct BridgeState {
    pub runner: Arc<SessionRunner>,
    pub recorder: Arc<EventRecorder>,
    pub config: BridgeConfig,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

type ControlResult = (StatusCode, Json<StatusResponse>);

fn ok(status: impl Into<String>) -> ControlResult {
    (
        StatusCode::OK,
        Json(StatusResponse {
            status: status.into(),
        }),
    )
}

fn fail(error: &BridgeError, status: impl Into<String>) -> ControlResult {
    let code = match error {
        BridgeError::AlreadyRunning
        | BridgeError::NotRunning
        | BridgeError::SessionUnavailable
        | BridgeError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        code,
        Json(StatusResponse {
            status: status.into(),
        }),
    )
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/calibrate", post(calibrate))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/discover", get(discover))
        .route("/recording/save", post(save_recording))
        .route("/recording/clear", post(clear_recording))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ConnectRequest {
    /// IPv4 host of the device unit; default ports apply
    address: Option<String>,
    /// Full device configuration, overrides `address`
    device: Option<DeviceConfig>,
}

async fn connect(
    State(state): State<BridgeState>,
    body: Option<Json<ConnectRequest>>,
) -> ControlResult {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let config = match (request.device, request.address, &state.config.device_host) {
        (Some(device), _, _) => device,
        (None, Some(address), _) => DeviceConfig::for_host(address),
        (None, None, Some(host)) => DeviceConfig::for_host(host.clone()),
        (None, None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(StatusResponse {
                    status: "No device address given and no default configured".to_string(),
                }),
            )
        }
    };

    match state.runner.connect(config).await {
        Ok(description) => ok(format!("Connected to {}", description)),
        Err(e) => fail(&e, format!("Error connecting: {}", e)),
    }
}

async fn disconnect(State(state): State<BridgeState>) -> ControlResult {
    match state.runner.disconnect().await {
        Ok(true) => ok("Device disconnected"),
        Ok(false) => (
            StatusCode::BAD_REQUEST,
            Json(StatusResponse {
                status: "No active device session".to_string(),
            }),
        ),
        Err(e) => fail(&e, format!("Error disconnecting: {}", e)),
    }
}

async fn start(State(state): State<BridgeState>) -> ControlResult {
    match state.runner.start().await {
        Ok(()) => ok("Stream started"),
        Err(e @ BridgeError::SessionUnavailable) => fail(&e, "Device is not connected"),
        Err(e @ BridgeError::AlreadyRunning) => fail(&e, "Stream already running"),
        Err(e) => fail(&e, format!("Error starting stream: {}", e)),
    }
}

async fn stop(State(state): State<BridgeState>) -> ControlResult {
    match state.runner.stop().await {
        Ok(()) => ok("Stream stopped"),
        Err(e @ BridgeError::NotRunning) => fail(&e, "Stream was not running"),
        Err(e) => fail(&e, format!("Error stopping stream: {}", e)),
    }
}

async fn calibrate(State(state): State<BridgeState>) -> ControlResult {
    match state.runner.calibrate().await {
        Ok(true) => ok("Calibration successful"),
        Ok(false) => ok("Calibration failed"),
        Err(e) => fail(&e, format!("Error calibrating: {}", e)),
    }
}

async fn status(State(state): State<BridgeState>) -> Json<RunnerStatus> {
    Json(state.runner.status().await)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    #[serde(default = "default_discover_timeout")]
    timeout_secs: u64,
}

fn default_discover_timeout() -> u64 {
    3
}

async fn discover(
    Query(query): Query<DiscoverQuery>,
) -> Result<Json<Vec<discovery::DiscoveredDevice>>, ControlResult> {
    discovery::discover_devices(query.timeout_secs)
        .await
        .map(Json)
        .map_err(|e| {
            warn!("Device discovery failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StatusResponse {
                    status: format!("Discovery failed: {}", e),
                }),
            )
        })
}

#[derive(Debug, Deserialize)]
struct SaveRequest {
    path: String,
}

async fn save_recording(
    State(state): State<BridgeState>,
    Json(request): Json<SaveRequest>,
) -> ControlResult {
    match state.recorder.save(&request.path).await {
        Ok(count) => ok(format!("Saved {} events to {}", count, request.path)),
        Err(e) => fail(&e, format!("Error saving recording: {}", e)),
    }
}

async fn clear_recording(State(state): State<BridgeState>) -> ControlResult {
    state.recorder.clear();
    ok("Recording cleared")
}
