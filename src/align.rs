// Stream alignment
//
// Merges the scene-camera and gaze channels of one session into a single
// ordered sequence of gaze events. For each scene frame, the gaze channel
// is advanced past every sample older than the frame, and the first
// sample at or after the frame's timestamp is emitted. Gaze is never
// reported ahead of the frame it belongs to, and at most one pulled
// sample per channel is held at a time.

use crate::device::{GazeSample, SampleStreams, SceneSample};
use crate::types::{BridgeError, BridgeResult, GazeEvent};
use tokio::sync::mpsc;

pub struct StreamAligner {
    scene: mpsc::Receiver<SceneSample>,
    gaze: mpsc::Receiver<GazeSample>,
    max_stale_per_frame: usize,
    stale_dropped: u64,
}

impl StreamAligner {
    pub fn new(streams: SampleStreams, max_stale_per_frame: usize) -> Self {
        Self {
            scene: streams.scene,
            gaze: streams.gaze,
            max_stale_per_frame,
            stale_dropped: 0,
        }
    }

    /// Produce the next aligned gaze event.
    ///
    /// `Ok(None)` when the scene channel has ended (clean end of stream);
    /// `Err` when the gaze channel closed with frames still arriving, a
    /// state the pipeline cannot recover from.
    pub async fn next_event(&mut self) -> BridgeResult<Option<GazeEvent>> {
        'frame: loop {
            // Next scene frame carrying a usable timestamp
            let frame_ts = loop {
                match self.scene.recv().await {
                    Some(SceneSample {
                        timestamp: Some(ts),
                    }) => break ts,
                    Some(_) => continue,
                    None => return Ok(None),
                }
            };

            // Advance the gaze channel to the first sample not earlier
            // than the frame. Equal timestamps are accepted.
            let mut discarded = 0usize;
            let (sample, gaze_ts) = loop {
                let sample = match self.gaze.recv().await {
                    Some(sample) => sample,
                    None => {
                        return Err(BridgeError::Pipeline(
                            "gaze channel closed mid-stream".to_string(),
                        ))
                    }
                };

                let Some(ts) = sample.timestamp else { continue };

                if ts < frame_ts {
                    self.stale_dropped += 1;
                    discarded += 1;
                    if discarded >= self.max_stale_per_frame {
                        // The gaze channel is lagging too far behind this
                        // frame; abandon it and resync on the next one.
                        tracing::warn!(
                            "Discarded {} stale gaze samples for frame at {}, skipping frame",
                            discarded,
                            frame_ts
                        );
                        continue 'frame;
                    }
                    continue;
                }

                break (sample, ts);
            };

            let event = match sample.gaze2d {
                Some([x, y]) => GazeEvent {
                    x,
                    y,
                    timestamp: gaze_ts,
                },
                None => GazeEvent::no_gaze(gaze_ts),
            };

            return Ok(Some(event));
        }
    }

    /// Total stale gaze samples discarded so far
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn aligner_for(
        scene: Vec<Option<f64>>,
        gaze: Vec<(Option<f64>, Option<[f64; 2]>)>,
        max_stale: usize,
    ) -> StreamAligner {
        let (scene_tx, scene_rx) = mpsc::channel(64);
        let (gaze_tx, gaze_rx) = mpsc::channel(64);

        for timestamp in scene {
            scene_tx.try_send(SceneSample { timestamp }).unwrap();
        }
        for (timestamp, gaze2d) in gaze {
            gaze_tx.try_send(GazeSample { timestamp, gaze2d }).unwrap();
        }
        drop(scene_tx);
        drop(gaze_tx);

        StreamAligner::new(
            SampleStreams {
                scene: scene_rx,
                gaze: gaze_rx,
            },
            max_stale,
        )
    }

    #[tokio::test]
    async fn test_stale_gaze_discarded_then_sentinel() {
        // Frames at [100, 200, 300]; gaze at 90 is stale for frame 100,
        // 150 matches it, 250 (no gaze2d) covers frame 200 as a sentinel,
        // and frame 300 is never covered.
        let (scene_tx, scene_rx) = mpsc::channel(8);
        let (gaze_tx, gaze_rx) = mpsc::channel(8);
        for ts in [100.0, 200.0, 300.0] {
            scene_tx
                .try_send(SceneSample {
                    timestamp: Some(ts),
                })
                .unwrap();
        }
        gaze_tx
            .try_send(GazeSample {
                timestamp: Some(90.0),
                gaze2d: Some([0.1, 0.2]),
            })
            .unwrap();
        gaze_tx
            .try_send(GazeSample {
                timestamp: Some(150.0),
                gaze2d: Some([0.3, 0.4]),
            })
            .unwrap();
        gaze_tx
            .try_send(GazeSample {
                timestamp: Some(250.0),
                gaze2d: None,
            })
            .unwrap();

        let mut aligner = StreamAligner::new(
            SampleStreams {
                scene: scene_rx,
                gaze: gaze_rx,
            },
            1000,
        );

        let first = aligner.next_event().await.unwrap().unwrap();
        assert_eq!(
            first,
            GazeEvent {
                x: 0.3,
                y: 0.4,
                timestamp: 150.0
            }
        );

        let second = aligner.next_event().await.unwrap().unwrap();
        assert!(second.is_no_gaze());
        assert_eq!(second.timestamp, 250.0);

        // Frame 300 has no covering gaze sample and both channels are
        // still open: the aligner must block, not emit.
        let pending = timeout(Duration::from_millis(50), aligner.next_event()).await;
        assert!(pending.is_err());

        assert_eq!(aligner.stale_dropped(), 1);
        drop(scene_tx);
        drop(gaze_tx);
    }

    #[tokio::test]
    async fn test_one_event_per_frame_with_timestamps_covering() {
        let scene = vec![Some(10.0), Some(20.0), Some(30.0)];
        let gaze = vec![
            (Some(10.0), Some([0.1, 0.1])), // equal timestamp accepted
            (Some(25.0), Some([0.2, 0.2])),
            (Some(30.0), Some([0.3, 0.3])),
        ];
        let mut aligner = aligner_for(scene, gaze, 1000);

        let mut events = Vec::new();
        while let Some(event) = aligner.next_event().await.unwrap() {
            events.push(event);
        }

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp, 10.0);
        assert_eq!(events[1].timestamp, 25.0);
        assert_eq!(events[2].timestamp, 30.0);
        // Timestamps never run backwards and each covers its frame
        assert!(events[0].timestamp >= 10.0);
        assert!(events[1].timestamp >= 20.0);
        assert!(events[2].timestamp >= 30.0);
    }

    #[tokio::test]
    async fn test_all_sentinels_when_gaze2d_absent() {
        let scene = vec![Some(1.0), Some(2.0)];
        let gaze = vec![(Some(1.0), None), (Some(2.5), None)];
        let mut aligner = aligner_for(scene, gaze, 1000);

        let mut events = Vec::new();
        while let Some(event) = aligner.next_event().await.unwrap() {
            events.push(event);
        }

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is_no_gaze()));
    }

    #[tokio::test]
    async fn test_untimestamped_samples_skipped() {
        let scene = vec![None, Some(100.0)];
        let gaze = vec![(None, Some([0.9, 0.9])), (Some(120.0), Some([0.5, 0.6]))];
        let mut aligner = aligner_for(scene, gaze, 1000);

        let event = aligner.next_event().await.unwrap().unwrap();
        assert_eq!(event.timestamp, 120.0);
        assert_eq!(event.x, 0.5);
    }

    #[tokio::test]
    async fn test_scene_close_ends_stream() {
        let mut aligner = aligner_for(vec![], vec![(Some(1.0), None)], 1000);
        assert!(aligner.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gaze_close_is_fault() {
        let mut aligner = aligner_for(vec![Some(1.0)], vec![], 1000);
        match aligner.next_event().await {
            Err(BridgeError::Pipeline(_)) => {}
            other => panic!("expected pipeline fault, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_stale_bound_abandons_frame() {
        // Frame 100 exhausts the stale bound; alignment resyncs on frame
        // 110, which the next gaze sample covers.
        let scene = vec![Some(100.0), Some(110.0)];
        let gaze = vec![
            (Some(10.0), Some([0.1, 0.1])),
            (Some(20.0), Some([0.2, 0.2])),
            (Some(150.0), Some([0.7, 0.8])),
        ];
        let mut aligner = aligner_for(scene, gaze, 2);

        let event = aligner.next_event().await.unwrap().unwrap();
        assert_eq!(event.timestamp, 150.0);
        assert_eq!(event.x, 0.7);
        assert_eq!(aligner.stale_dropped(), 2);
    }
}
