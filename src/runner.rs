// Session runner - single authority over the streaming pipeline
//
// The runner owns:
// - The device session slot (connect/disconnect/calibrate)
// - The pipeline lifecycle (start, stop, fatal-error recovery)
// - The broadcast listener tied to the pipeline's lifetime
// - Run state and statistics for the status surface
//
// One CancellationToken per start is checked at every suspension point;
// stop cancels it, joins the pipeline task under a grace period, and
// aborts the task if the grace period elapses.

use crate::align::StreamAligner;
use crate::broadcast::{self, BroadcastHub};
use crate::config::BridgeConfig;
use crate::device::{self, DeviceConfig, DeviceSession};
use crate::recorder::EventRecorder;
use crate::types::{BridgeError, BridgeResult, BridgeStats, GazeEvent, RunState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::RwLock as TokioRwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type SessionSlot = Arc<TokioRwLock<Option<Box<dyn DeviceSession>>>>;

/// Snapshot of the runner for the status surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub state: RunState,
    pub device: Option<String>,
    pub last_error: Option<String>,
    pub stats: BridgeStats,
}

pub struct SessionRunner {
    config: BridgeConfig,
    hub: Arc<BroadcastHub>,
    recorder: Arc<EventRecorder>,

    session: SessionSlot,
    device_config: Mutex<Option<DeviceConfig>>,

    state: Arc<Mutex<RunState>>,
    cancel: Mutex<Option<CancellationToken>>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    last_error: Arc<Mutex<Option<String>>>,
    started_at: Mutex<Option<Instant>>,

    events_broadcast: Arc<AtomicU64>,
    stale_dropped: Arc<AtomicU64>,
}

impl SessionRunner {
    pub fn new(config: BridgeConfig, hub: Arc<BroadcastHub>, recorder: Arc<EventRecorder>) -> Self {
        Self {
            config,
            hub,
            recorder,
            session: Arc::new(TokioRwLock::new(None)),
            device_config: Mutex::new(None),
            state: Arc::new(Mutex::new(RunState::Idle)),
            cancel: Mutex::new(None),
            pipeline: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
            started_at: Mutex::new(None),
            events_broadcast: Arc::new(AtomicU64::new(0)),
            stale_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    /// Establish a device session. Replaces (and closes) any previous
    /// session; refused while a stream is active.
    pub async fn connect(&self, config: DeviceConfig) -> BridgeResult<String> {
        if *self.state.lock() != RunState::Idle {
            return Err(BridgeError::AlreadyRunning);
        }

        let session = device::connect(config.clone()).await?;
        let description = session.describe();

        if let Some(mut previous) = self.session.write().await.replace(session) {
            if let Err(e) = previous.close().await {
                warn!("Failed to close previous session: {}", e);
            }
        }
        *self.device_config.lock() = Some(config);
        *self.last_error.lock() = None;

        Ok(description)
    }

    /// Release the device session if present. Stops the stream first
    /// when one is active. Returns whether a session was released.
    pub async fn disconnect(&self) -> BridgeResult<bool> {
        if *self.state.lock() == RunState::Running {
            if let Err(e) = self.stop().await {
                warn!("Stop before disconnect failed: {}", e);
            }
        }

        match self.session.write().await.take() {
            Some(mut session) => {
                session.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start the streaming pipeline.
    ///
    /// Requires an established session and an idle runner. Returns as
    /// soon as the pipeline task is spawned; the stream runs in the
    /// background until `stop`, end of stream, or a fatal error.
    pub async fn start(&self) -> BridgeResult<()> {
        if self.session.read().await.is_none() {
            return Err(BridgeError::SessionUnavailable);
        }

        {
            let mut state = self.state.lock();
            if *state != RunState::Idle {
                return Err(BridgeError::AlreadyRunning);
            }
            *state = RunState::Running;
        }

        let pipeline_id = uuid::Uuid::new_v4();
        info!("Starting streaming pipeline {}", pipeline_id);

        self.hub.reset();
        self.events_broadcast.store(0, Ordering::Relaxed);
        self.stale_dropped.store(0, Ordering::Relaxed);
        *self.last_error.lock() = None;
        *self.started_at.lock() = Some(Instant::now());

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let ctx = PipelineContext {
            ws_bind_addr: self.config.ws_bind_addr.clone(),
            max_stale_per_frame: self.config.max_stale_per_frame,
            session: Arc::clone(&self.session),
            hub: Arc::clone(&self.hub),
            recorder: Arc::clone(&self.recorder),
            events_broadcast: Arc::clone(&self.events_broadcast),
            stale_dropped: Arc::clone(&self.stale_dropped),
            cancel: cancel.clone(),
        };

        let state = Arc::clone(&self.state);
        let last_error = Arc::clone(&self.last_error);
        let hub = Arc::clone(&self.hub);

        let handle = tokio::spawn(async move {
            let result = run_pipeline(ctx).await;

            // Teardown happens on every exit path: stop request, clean
            // end of stream, and fatal fault alike.
            cancel.cancel();
            hub.shutdown();

            if let Err(e) = result {
                error!("Pipeline {} fault: {}", pipeline_id, e);
                *last_error.lock() = Some(e.to_string());
            } else {
                info!("Pipeline {} finished", pipeline_id);
            }

            *state.lock() = RunState::Idle;
        });

        *self.pipeline.lock() = Some(handle);

        Ok(())
    }

    /// Stop the streaming pipeline and tear down the listener.
    ///
    /// Waits for the pipeline task up to the configured grace period; a
    /// task that does not finish in time is aborted and the timeout
    /// logged, not surfaced.
    pub async fn stop(&self) -> BridgeResult<()> {
        {
            let mut state = self.state.lock();
            if *state != RunState::Running {
                return Err(BridgeError::NotRunning);
            }
            *state = RunState::Stopping;
        }

        info!("Stopping streaming pipeline");

        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let handle = self.pipeline.lock().take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.config.shutdown_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Pipeline task failed during shutdown: {}", e),
                Err(_) => {
                    warn!(
                        "Pipeline did not shut down within {:?}, aborting",
                        self.config.shutdown_grace
                    );
                    handle.abort();
                }
            }
        }

        *self.state.lock() = RunState::Idle;
        info!("Streaming pipeline stopped");

        Ok(())
    }

    /// Run the device calibration routine on an independent short-lived
    /// session, built from the most recent connect configuration.
    pub async fn calibrate(&self) -> BridgeResult<bool> {
        let config = self
            .device_config
            .lock()
            .clone()
            .ok_or(BridgeError::SessionUnavailable)?;

        let mut session = device::connect(config).await?;
        let outcome = session.calibrate().await;
        if let Err(e) = session.close().await {
            warn!("Failed to close calibration session: {}", e);
        }

        outcome
    }

    pub async fn status(&self) -> RunnerStatus {
        let state = *self.state.lock();
        let device = self
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.describe());

        let uptime_seconds = match state {
            RunState::Running => self
                .started_at
                .lock()
                .as_ref()
                .map(|started| started.elapsed().as_secs_f64()),
            _ => None,
        };

        RunnerStatus {
            state,
            device,
            last_error: self.last_error.lock().clone(),
            stats: BridgeStats {
                events_broadcast: self.events_broadcast.load(Ordering::Relaxed),
                stale_gaze_dropped: self.stale_dropped.load(Ordering::Relaxed),
                subscribers: self.hub.subscriber_count(),
                uptime_seconds,
            },
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }
}

impl Drop for SessionRunner {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

struct PipelineContext {
    ws_bind_addr: String,
    max_stale_per_frame: usize,
    session: SessionSlot,
    hub: Arc<BroadcastHub>,
    recorder: Arc<EventRecorder>,
    events_broadcast: Arc<AtomicU64>,
    stale_dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Grace period for the listener task to release its socket
const LISTENER_CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// Drive one streaming session: listener up, streams open, then
/// align-and-publish until cancellation, end of stream, or fault.
async fn run_pipeline(ctx: PipelineContext) -> BridgeResult<()> {
    let listener = TcpListener::bind(&ctx.ws_bind_addr)
        .await
        .map_err(|e| BridgeError::WebSocket(format!("bind {}: {}", ctx.ws_bind_addr, e)))?;
    info!("Broadcast listener on ws://{}", ctx.ws_bind_addr);

    let serve_task = tokio::spawn(broadcast::serve(
        listener,
        Arc::clone(&ctx.hub),
        ctx.cancel.clone(),
    ));

    let result = drive_stream(&ctx).await;

    // Release the listener socket before the pipeline is reported done,
    // so a subsequent start can bind the same port. Best effort: on
    // timeout shutdown proceeds anyway.
    ctx.cancel.cancel();
    if tokio::time::timeout(LISTENER_CLOSE_GRACE, serve_task)
        .await
        .is_err()
    {
        warn!("Broadcast listener did not close within the grace period");
    }

    result
}

async fn drive_stream(ctx: &PipelineContext) -> BridgeResult<()> {
    let streams = {
        let mut slot = ctx.session.write().await;
        let session = slot.as_mut().ok_or(BridgeError::SessionUnavailable)?;
        session.start_streams().await?
    };

    let mut aligner = StreamAligner::new(streams, ctx.max_stale_per_frame);

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                info!("Pipeline cancelled");
                return Ok(());
            }

            event = aligner.next_event() => match event {
                Ok(Some(event)) => {
                    publish_event(ctx, &aligner, event);
                }
                Ok(None) => {
                    info!("Scene stream ended");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn publish_event(ctx: &PipelineContext, aligner: &StreamAligner, event: GazeEvent) {
    ctx.recorder.record(event);
    ctx.hub.publish(&event);
    ctx.events_broadcast.fetch_add(1, Ordering::Relaxed);
    ctx.stale_dropped
        .store(aligner.stale_dropped(), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GazeSample, SampleStreams, SceneSample};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, Duration};

    /// Session stub that emits a fixed sample set, then keeps both
    /// channels open (or closes them, per `close_after`).
    struct StubSession {
        scene: Vec<SceneSample>,
        gaze: Vec<GazeSample>,
        close_after: bool,
    }

    #[async_trait]
    impl DeviceSession for StubSession {
        async fn start_streams(&mut self) -> BridgeResult<SampleStreams> {
            let (scene_tx, scene_rx) = mpsc::channel(64);
            let (gaze_tx, gaze_rx) = mpsc::channel(64);

            let scene = self.scene.clone();
            let gaze = self.gaze.clone();
            let close_after = self.close_after;

            tokio::spawn(async move {
                for sample in scene {
                    if scene_tx.send(sample).await.is_err() {
                        return;
                    }
                }
                for sample in gaze {
                    if gaze_tx.send(sample).await.is_err() {
                        return;
                    }
                }
                if !close_after {
                    // Keep the channels open so the pipeline idles at a
                    // suspension point instead of terminating.
                    sleep(Duration::from_secs(60)).await;
                    drop(scene_tx);
                    drop(gaze_tx);
                }
            });

            Ok(SampleStreams {
                scene: scene_rx,
                gaze: gaze_rx,
            })
        }

        async fn calibrate(&mut self) -> BridgeResult<bool> {
            Ok(true)
        }

        async fn close(&mut self) -> BridgeResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "stub://".to_string()
        }
    }

    fn runner_with_session(session: StubSession) -> SessionRunner {
        let config = BridgeConfig {
            // Port 0: every test gets its own listener
            ws_bind_addr: "127.0.0.1:0".to_string(),
            shutdown_grace: Duration::from_secs(1),
            ..BridgeConfig::default()
        };
        let runner = SessionRunner::new(
            config,
            Arc::new(BroadcastHub::new()),
            Arc::new(EventRecorder::new(1024)),
        );
        *runner.session.try_write().unwrap() = Some(Box::new(session));
        runner
    }

    fn idle_stub() -> StubSession {
        StubSession {
            scene: vec![],
            gaze: vec![],
            close_after: false,
        }
    }

    #[tokio::test]
    async fn test_start_without_session() {
        let runner = SessionRunner::new(
            BridgeConfig::default(),
            Arc::new(BroadcastHub::new()),
            Arc::new(EventRecorder::new(16)),
        );
        assert!(matches!(
            runner.start().await,
            Err(BridgeError::SessionUnavailable)
        ));
        assert_eq!(runner.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_stop_while_idle_has_no_side_effects() {
        let runner = runner_with_session(idle_stub());
        assert!(matches!(runner.stop().await, Err(BridgeError::NotRunning)));
        assert_eq!(runner.state(), RunState::Idle);
        assert!(runner.session.read().await.is_some());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let runner = runner_with_session(idle_stub());

        runner.start().await.unwrap();
        assert!(matches!(
            runner.start().await,
            Err(BridgeError::AlreadyRunning)
        ));
        // Only the first pipeline exists
        assert!(runner.pipeline.lock().is_some());

        runner.stop().await.unwrap();
        assert_eq!(runner.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_events_flow_and_clean_stop() {
        let session = StubSession {
            scene: vec![
                SceneSample {
                    timestamp: Some(100.0),
                },
                SceneSample {
                    timestamp: Some(200.0),
                },
            ],
            gaze: vec![
                GazeSample {
                    timestamp: Some(150.0),
                    gaze2d: Some([0.3, 0.4]),
                },
                GazeSample {
                    timestamp: Some(250.0),
                    gaze2d: None,
                },
            ],
            close_after: false,
        };
        let runner = runner_with_session(session);

        runner.start().await.unwrap();
        assert_eq!(runner.state(), RunState::Running);

        // Give the pipeline a moment to drain the stub samples
        for _ in 0..50 {
            if runner.events_broadcast.load(Ordering::Relaxed) >= 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let status = runner.status().await;
        assert_eq!(status.stats.events_broadcast, 2);
        assert!(status.last_error.is_none());

        runner.stop().await.unwrap();
        assert_eq!(runner.state(), RunState::Idle);

        // Stopping again is a user error, not a crash
        assert!(matches!(runner.stop().await, Err(BridgeError::NotRunning)));
    }

    #[tokio::test]
    async fn test_fatal_fault_resets_to_idle() {
        // Gaze channel closes while a frame is still waiting: pipeline
        // fault, Running -> Idle without a stop call.
        let session = StubSession {
            scene: vec![SceneSample {
                timestamp: Some(100.0),
            }],
            gaze: vec![],
            close_after: true,
        };
        let runner = runner_with_session(session);

        runner.start().await.unwrap();

        for _ in 0..50 {
            if runner.state() == RunState::Idle {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(runner.state(), RunState::Idle);
        let status = runner.status().await;
        assert!(status.last_error.is_some());
    }
}
