// Device session layer
//
// A session against a wearable eye-tracking unit yields two independent
// timestamped sample channels: the scene camera and the gaze tracker.
// The `DeviceSession` trait is the capability boundary the rest of the
// bridge programs against; new device kinds are added by:
// 1. Implementing the DeviceSession trait
// 2. Adding a variant to DeviceConfig
// 3. Registering in the factory function
//
// Current implementations:
// - Tcp: a unit reachable at an IPv4 host, NDJSON sample channels
// - Replay: streams a recorded capture file, for development and tests

pub mod discovery;
mod replay;
mod tcp;

pub use replay::{Recording, ReplaySession};
pub use tcp::TcpDeviceSession;

use crate::types::BridgeResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Depth of each sample channel between a device reader and the aligner
pub(crate) const SAMPLE_CHANNEL_DEPTH: usize = 64;

/// One sample from the scene-camera channel.
///
/// The frame payload itself is not decoded; only the presentation
/// timestamp matters to the bridge. `timestamp` is `None` when the packet
/// carried no usable presentation time (transient decode gap).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SceneSample {
    pub timestamp: Option<f64>,
}

/// One sample from the gaze channel.
///
/// `gaze2d` is a normalized 2-D coordinate; `None` means the device
/// reported no gaze at this instant (blink, tracking loss).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GazeSample {
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub gaze2d: Option<[f64; 2]>,
}

/// The two sample channels of an open streaming session.
///
/// The device readers run until the session is closed or both receivers
/// are dropped; a closed channel means that stream has ended.
pub struct SampleStreams {
    pub scene: mpsc::Receiver<SceneSample>,
    pub gaze: mpsc::Receiver<GazeSample>,
}

/// Configuration for the supported device session kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceConfig {
    /// A physical unit reachable over the network
    #[serde(rename = "tcp")]
    Tcp {
        host: String,
        #[serde(default = "default_control_port")]
        control_port: u16,
        #[serde(default = "default_scene_port")]
        scene_port: u16,
        #[serde(default = "default_gaze_port")]
        gaze_port: u16,
    },

    /// Replay of a recorded capture file
    #[serde(rename = "replay")]
    Replay {
        path: String,
        /// Delay between samples in milliseconds (simulates real-time)
        #[serde(default)]
        rate_limit_ms: Option<u64>,
        /// Restart from the beginning when the capture is exhausted
        #[serde(default)]
        loop_playback: bool,
    },
}

fn default_control_port() -> u16 {
    80
}

fn default_scene_port() -> u16 {
    8554
}

fn default_gaze_port() -> u16 {
    8555
}

impl DeviceConfig {
    /// Config for a unit at `host` with the default ports
    pub fn for_host(host: impl Into<String>) -> Self {
        Self::Tcp {
            host: host.into(),
            control_port: default_control_port(),
            scene_port: default_scene_port(),
            gaze_port: default_gaze_port(),
        }
    }
}

/// A live device streaming context. At most one is active per bridge.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Open the scene-camera and gaze channels for this session.
    ///
    /// May be called again after the previous streams have been torn down
    /// (stop followed by a new start on the same session).
    async fn start_streams(&mut self) -> BridgeResult<SampleStreams>;

    /// Run the device calibration routine.
    ///
    /// `Ok(true)` means the device accepted the calibration, `Ok(false)`
    /// that it ran and was rejected; `Err` that it could not be run.
    async fn calibrate(&mut self) -> BridgeResult<bool>;

    /// Close the session and release the underlying connection.
    async fn close(&mut self) -> BridgeResult<()>;

    fn is_connected(&self) -> bool;

    /// Human-readable description for status reporting
    fn describe(&self) -> String;
}

/// Factory: establish a session from configuration.
///
/// New device kinds are registered here, next to their DeviceConfig
/// variant.
pub async fn connect(config: DeviceConfig) -> BridgeResult<Box<dyn DeviceSession>> {
    match config {
        DeviceConfig::Tcp {
            host,
            control_port,
            scene_port,
            gaze_port,
        } => {
            let mut session = TcpDeviceSession::new(host, control_port, scene_port, gaze_port);
            session.connect().await?;
            Ok(Box::new(session))
        }

        DeviceConfig::Replay {
            path,
            rate_limit_ms,
            loop_playback,
        } => {
            let mut session = ReplaySession::new(path, rate_limit_ms, loop_playback);
            session.connect().await?;
            Ok(Box::new(session))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_json() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{"type": "tcp", "host": "192.168.75.51"}"#).unwrap();
        match config {
            DeviceConfig::Tcp {
                host,
                control_port,
                scene_port,
                gaze_port,
            } => {
                assert_eq!(host, "192.168.75.51");
                assert_eq!(control_port, 80);
                assert_eq!(scene_port, 8554);
                assert_eq!(gaze_port, 8555);
            }
            _ => panic!("expected tcp config"),
        }
    }

    #[test]
    fn test_gaze_sample_without_gaze2d() {
        let sample: GazeSample = serde_json::from_str(r#"{"timestamp": 250.0}"#).unwrap();
        assert_eq!(sample.timestamp, Some(250.0));
        assert!(sample.gaze2d.is_none());
    }
}
