pub mod align;
pub mod broadcast;
pub mod config;
pub mod device;
pub mod recorder;
pub mod runner;
pub mod server;
pub mod types;

pub use align::StreamAligner;
pub use broadcast::{BroadcastHub, SubscriberId, SubscriberInfo};
pub use config::BridgeConfig;
pub use device::{DeviceConfig, DeviceSession, GazeSample, SampleStreams, SceneSample};
pub use recorder::EventRecorder;
pub use runner::{RunnerStatus, SessionRunner};
pub use server::{router, BridgeState};
pub use types::{BridgeError, BridgeResult, BridgeStats, GazeEvent, RunState};
