// Common types for the bridge

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while managing or driving a streaming session
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Stream already running")]
    AlreadyRunning,

    #[error("Stream not running")]
    NotRunning,

    #[error("No device session available")]
    SessionUnavailable,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Pipeline fault: {0}")]
    Pipeline(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// One gaze-at-frame-time record broadcast to subscribers.
///
/// `x`/`y` are normalized coordinates in [0, 1], or the sentinel pair
/// (-1, -1) when the device reported no gaze at this instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GazeEvent {
    pub x: f64,
    pub y: f64,
    pub timestamp: f64,
}

impl GazeEvent {
    /// Sentinel event: no gaze detected at this timestamp
    pub fn no_gaze(timestamp: f64) -> Self {
        Self {
            x: -1.0,
            y: -1.0,
            timestamp,
        }
    }

    pub fn is_no_gaze(&self) -> bool {
        self.x == -1.0 && self.y == -1.0
    }
}

/// Lifecycle state of the streaming pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No pipeline active
    Idle,

    /// Pipeline task and broadcast listener are live
    Running,

    /// Stop requested, teardown in progress
    Stopping,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Statistics about the current or most recent streaming session
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeStats {
    pub events_broadcast: u64,
    pub stale_gaze_dropped: u64,
    pub subscribers: usize,
    pub uptime_seconds: Option<f64>,
}
