// TCP device session
//
// Connects to an eye-tracking unit at a network address. The scene and
// gaze channels carry newline-delimited JSON samples on dedicated ports;
// calibration is a one-shot request/response on the control port.

use super::{DeviceSession, GazeSample, SampleStreams, SceneSample, SAMPLE_CHANNEL_DEPTH};
use crate::types::{BridgeError, BridgeResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TcpDeviceSession {
    host: String,
    control_port: u16,
    scene_port: u16,
    gaze_port: u16,
    scene: Option<TcpStream>,
    gaze: Option<TcpStream>,
    reader_cancel: Option<CancellationToken>,
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct CalibrationReply {
    ok: bool,
}

impl TcpDeviceSession {
    pub fn new(host: String, control_port: u16, scene_port: u16, gaze_port: u16) -> Self {
        Self {
            host,
            control_port,
            scene_port,
            gaze_port,
            scene: None,
            gaze: None,
            reader_cancel: None,
            connected: false,
        }
    }

    /// Dial both sample channels
    pub async fn connect(&mut self) -> BridgeResult<()> {
        if self.connected {
            return Ok(());
        }

        tracing::info!("Connecting to device at {}", self.host);

        self.scene = Some(self.dial(self.scene_port, "scene").await?);
        self.gaze = Some(self.dial(self.gaze_port, "gaze").await?);
        self.connected = true;

        tracing::info!("Device connected: {}", self.describe());

        Ok(())
    }

    async fn dial(&self, port: u16, channel: &str) -> BridgeResult<TcpStream> {
        TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(|e| {
                BridgeError::Connection(format!("{} channel {}:{}: {}", channel, self.host, port, e))
            })
    }
}

#[async_trait]
impl DeviceSession for TcpDeviceSession {
    async fn start_streams(&mut self) -> BridgeResult<SampleStreams> {
        if !self.connected {
            return Err(BridgeError::SessionUnavailable);
        }

        // The sockets were consumed by a previous run of the pipeline;
        // dial fresh ones for a restart on the same session.
        let scene_sock = match self.scene.take() {
            Some(sock) => sock,
            None => self.dial(self.scene_port, "scene").await?,
        };
        let gaze_sock = match self.gaze.take() {
            Some(sock) => sock,
            None => self.dial(self.gaze_port, "gaze").await?,
        };

        let cancel = CancellationToken::new();
        self.reader_cancel = Some(cancel.clone());

        let (scene_tx, scene_rx) = mpsc::channel(SAMPLE_CHANNEL_DEPTH);
        let (gaze_tx, gaze_rx) = mpsc::channel(SAMPLE_CHANNEL_DEPTH);

        tokio::spawn(read_channel::<SceneSample>(
            scene_sock,
            scene_tx,
            cancel.clone(),
            "scene",
        ));
        tokio::spawn(read_channel::<GazeSample>(gaze_sock, gaze_tx, cancel, "gaze"));

        Ok(SampleStreams {
            scene: scene_rx,
            gaze: gaze_rx,
        })
    }

    async fn calibrate(&mut self) -> BridgeResult<bool> {
        tracing::info!("Running calibration on {}", self.host);

        let run = async {
            let mut stream = self.dial(self.control_port, "control").await?;
            stream
                .write_all(b"{\"action\":\"calibrate\"}\n")
                .await
                .map_err(|e| BridgeError::Calibration(format!("request failed: {}", e)))?;

            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .map_err(|e| BridgeError::Calibration(format!("no reply: {}", e)))?;

            let reply: CalibrationReply = serde_json::from_str(line.trim())
                .map_err(|e| BridgeError::Calibration(format!("bad reply: {}", e)))?;
            Ok(reply.ok)
        };

        timeout(CALIBRATION_TIMEOUT, run)
            .await
            .map_err(|_| BridgeError::Timeout("calibration did not finish".to_string()))?
    }

    async fn close(&mut self) -> BridgeResult<()> {
        if let Some(cancel) = self.reader_cancel.take() {
            cancel.cancel();
        }
        self.scene = None;
        self.gaze = None;
        self.connected = false;
        tracing::info!("Device session closed: {}", self.host);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn describe(&self) -> String {
        format!(
            "tcp://{} (scene:{}, gaze:{})",
            self.host, self.scene_port, self.gaze_port
        )
    }
}

/// Read newline-delimited JSON samples from a device channel until the
/// channel closes, the receiver is dropped, or the session is closed.
async fn read_channel<T: DeserializeOwned + Send + 'static>(
    sock: TcpStream,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
    channel: &'static str,
) {
    let mut reader = BufReader::new(sock);
    let mut line = String::new();

    loop {
        line.clear();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("{} reader cancelled", channel);
                break;
            }

            read = reader.read_line(&mut line) => match read {
                Ok(0) => {
                    tracing::info!("{} channel closed by device", channel);
                    break;
                }
                Ok(_) => match serde_json::from_str::<T>(line.trim()) {
                    Ok(sample) => {
                        if tx.send(sample).await.is_err() {
                            tracing::debug!("{} receiver closed", channel);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Undecodable {} packet: {}", channel, e);
                    }
                },
                Err(e) => {
                    tracing::error!("{} read error: {}", channel, e);
                    break;
                }
            }
        }
    }
}
