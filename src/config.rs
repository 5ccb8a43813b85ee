use std::env;
use std::time::Duration;
use thiserror::Error;

/// Bridge configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bind address for the HTTP control surface
    pub bind_addr: String,
    /// Bind address for the websocket broadcast listener
    pub ws_bind_addr: String,
    /// Device host used when a connect request carries no address
    pub device_host: Option<String>,
    /// Consecutive stale gaze samples discarded for one frame before the
    /// frame is abandoned
    pub max_stale_per_frame: usize,
    /// Grace period for the pipeline to shut down before it is aborted
    pub shutdown_grace: Duration,
    /// Maximum number of events kept by the recorder (oldest dropped)
    pub recording_capacity: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl BridgeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            bind_addr: env::var("GAZE_BRIDGE_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8000".to_string()),
            ws_bind_addr: env::var("GAZE_BRIDGE_WS_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8765".to_string()),
            device_host: env::var("GAZE_BRIDGE_DEVICE_HOST").ok(),
            max_stale_per_frame: parse_env("GAZE_BRIDGE_MAX_STALE_PER_FRAME", 1000)?,
            shutdown_grace: Duration::from_secs(parse_env("GAZE_BRIDGE_SHUTDOWN_GRACE_SECS", 5)?),
            recording_capacity: parse_env("GAZE_BRIDGE_RECORDING_CAPACITY", 100_000)?,
        })
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            ws_bind_addr: "127.0.0.1:8765".to_string(),
            device_host: None,
            max_stale_per_frame: 1000,
            shutdown_grace: Duration::from_secs(5),
            recording_capacity: 100_000,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.ws_bind_addr, "127.0.0.1:8765");
        assert_eq!(config.max_stale_per_frame, 1000);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }
}
