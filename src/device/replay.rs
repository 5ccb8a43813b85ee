// Replay device session
//
// Streams a recorded capture file as if a live unit were producing it,
// at a configurable rate, useful for:
// - Testing the pipeline without hardware
// - Replaying captured sessions
// - Demo and development

use super::{DeviceSession, GazeSample, SampleStreams, SceneSample, SAMPLE_CHANNEL_DEPTH};
use crate::types::{BridgeError, BridgeResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// A captured session: both channels, each in timestamp order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recording {
    #[serde(default)]
    pub scene: Vec<SceneSample>,
    #[serde(default)]
    pub gaze: Vec<GazeSample>,
}

pub struct ReplaySession {
    path: PathBuf,
    rate_limit_ms: Option<u64>,
    loop_playback: bool,
    recording: Option<Recording>,
    reader_cancel: Option<CancellationToken>,
    connected: bool,
}

impl ReplaySession {
    pub fn new(path: String, rate_limit_ms: Option<u64>, loop_playback: bool) -> Self {
        Self {
            path: PathBuf::from(path),
            rate_limit_ms,
            loop_playback,
            recording: None,
            reader_cancel: None,
            connected: false,
        }
    }

    /// Load and parse the capture file
    pub async fn connect(&mut self) -> BridgeResult<()> {
        if self.connected {
            return Ok(());
        }

        let path = self.path.clone();
        let recording = tokio::task::spawn_blocking(move || -> BridgeResult<Recording> {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| BridgeError::Parse(format!("invalid capture file: {}", e)))
        })
        .await
        .map_err(|e| BridgeError::Connection(format!("capture load failed: {}", e)))??;

        tracing::info!(
            "Loaded capture {}: {} scene samples, {} gaze samples",
            self.path.display(),
            recording.scene.len(),
            recording.gaze.len()
        );

        self.recording = Some(recording);
        self.connected = true;

        Ok(())
    }
}

#[async_trait]
impl DeviceSession for ReplaySession {
    async fn start_streams(&mut self) -> BridgeResult<SampleStreams> {
        let recording = self
            .recording
            .clone()
            .ok_or(BridgeError::SessionUnavailable)?;

        let cancel = CancellationToken::new();
        self.reader_cancel = Some(cancel.clone());

        let (scene_tx, scene_rx) = mpsc::channel(SAMPLE_CHANNEL_DEPTH);
        let (gaze_tx, gaze_rx) = mpsc::channel(SAMPLE_CHANNEL_DEPTH);

        let rate_limit_ms = self.rate_limit_ms;
        let loop_playback = self.loop_playback;

        tokio::spawn(async move {
            loop {
                if replay_pass(&recording, &scene_tx, &gaze_tx, rate_limit_ms, &cancel).await {
                    // a receiver went away or the session was closed
                    return;
                }
                if !loop_playback {
                    tracing::info!("Capture replay finished");
                    return;
                }
            }
        });

        Ok(SampleStreams {
            scene: scene_rx,
            gaze: gaze_rx,
        })
    }

    async fn calibrate(&mut self) -> BridgeResult<bool> {
        // A capture has no calibration routine; report success so control
        // flows can be exercised against a replay.
        tracing::info!("Replay session: calibration is a no-op");
        Ok(true)
    }

    async fn close(&mut self) -> BridgeResult<()> {
        if let Some(cancel) = self.reader_cancel.take() {
            cancel.cancel();
        }
        self.recording = None;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn describe(&self) -> String {
        format!("replay://{}", self.path.display())
    }
}

/// Stream one full pass of the capture, both channels merged in timestamp
/// order. Returns true when replay should stop for good.
async fn replay_pass(
    recording: &Recording,
    scene_tx: &mpsc::Sender<SceneSample>,
    gaze_tx: &mpsc::Sender<GazeSample>,
    rate_limit_ms: Option<u64>,
    cancel: &CancellationToken,
) -> bool {
    let mut scene_idx = 0;
    let mut gaze_idx = 0;

    while scene_idx < recording.scene.len() || gaze_idx < recording.gaze.len() {
        if cancel.is_cancelled() {
            return true;
        }

        // Untimestamped samples replay immediately, in capture order
        let scene_ts = recording
            .scene
            .get(scene_idx)
            .map(|s| s.timestamp.unwrap_or(f64::NEG_INFINITY));
        let gaze_ts = recording
            .gaze
            .get(gaze_idx)
            .map(|s| s.timestamp.unwrap_or(f64::NEG_INFINITY));

        let send_scene = match (scene_ts, gaze_ts) {
            (Some(s), Some(g)) => s <= g,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let delivered = if send_scene {
            let sample = recording.scene[scene_idx];
            scene_idx += 1;
            scene_tx.send(sample).await.is_ok()
        } else {
            let sample = recording.gaze[gaze_idx];
            gaze_idx += 1;
            gaze_tx.send(sample).await.is_ok()
        };

        if !delivered {
            tracing::debug!("Replay receiver closed");
            return true;
        }

        if let Some(delay_ms) = rate_limit_ms {
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    false
}
