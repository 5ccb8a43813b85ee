// Event recorder
//
// Keeps the broadcast gaze events in a bounded in-memory log (oldest
// dropped first) so an operator can save a session to disk on demand.
// The saved file is a JSON array of {x, y, timestamp} records.

use crate::types::{BridgeResult, GazeEvent};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct EventRecorder {
    events: RwLock<VecDeque<GazeEvent>>,
    capacity: usize,
    total_dropped: AtomicU64,
}

impl EventRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: GazeEvent) {
        let mut events = self.events.write();
        if events.len() >= self.capacity {
            events.pop_front();
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
    }

    /// Write the accumulated events to `path` and return how many were
    /// saved
    pub async fn save(&self, path: impl AsRef<Path>) -> BridgeResult<usize> {
        let snapshot: Vec<GazeEvent> = self.events.read().iter().copied().collect();

        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| crate::types::BridgeError::Parse(format!("serialize failed: {}", e)))?;
        tokio::fs::write(path.as_ref(), json).await?;

        tracing::info!(
            "Saved {} gaze events to {}",
            snapshot.len(),
            path.as_ref().display()
        );

        Ok(snapshot.len())
    }

    pub fn clear(&self) {
        self.events.write().clear();
        self.total_dropped.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(timestamp: f64) -> GazeEvent {
        GazeEvent {
            x: 0.1,
            y: 0.2,
            timestamp,
        }
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let recorder = EventRecorder::new(3);
        for i in 0..5 {
            recorder.record(event(i as f64));
        }

        assert_eq!(recorder.len(), 3);
        assert_eq!(recorder.total_dropped(), 2);

        let oldest = recorder.events.read().front().copied().unwrap();
        assert_eq!(oldest.timestamp, 2.0);
    }

    #[tokio::test]
    async fn test_save_round_trips() {
        let recorder = EventRecorder::new(100);
        recorder.record(event(1.0));
        recorder.record(GazeEvent::no_gaze(2.0));

        let path = std::env::temp_dir().join(format!("gaze-{}.json", uuid::Uuid::new_v4()));
        let saved = recorder.save(&path).await.unwrap();
        assert_eq!(saved, 2);

        let raw = std::fs::read_to_string(&path).unwrap();
        let loaded: Vec<GazeEvent> = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].timestamp, 1.0);
        assert!(loaded[1].is_no_gaze());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_clear() {
        let recorder = EventRecorder::new(10);
        recorder.record(event(1.0));
        recorder.clear();
        assert!(recorder.is_empty());
    }
}
