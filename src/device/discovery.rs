use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Service type announced by eye-tracking units on the local network
const SERVICE_TYPE: &str = "_tobii-g3api._tcp.local.";

/// A unit discovered on the local network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub serial: Option<String>,
}

/// Discover eye-tracking units on the local network
pub async fn discover_devices(timeout_secs: u64) -> Result<Vec<DiscoveredDevice>> {
    let mdns = ServiceDaemon::new()?;

    info!("Starting device discovery (timeout: {}s)", timeout_secs);

    let receiver = mdns.browse(SERVICE_TYPE)?;
    let mut devices = Vec::new();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        if tokio::time::Instant::now() > deadline {
            break;
        }

        match tokio::time::timeout(Duration::from_secs(1), receiver.recv_async()).await {
            Ok(Ok(event)) => {
                if let ServiceEvent::ServiceResolved(info) = event {
                    debug!("Discovered service: {}", info.get_fullname());

                    let serial = info
                        .get_properties()
                        .get_property_val_str("serial")
                        .map(|s| s.to_string());

                    let address = info
                        .get_addresses()
                        .iter()
                        .next()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|| info.get_hostname().to_string());

                    let device = DiscoveredDevice {
                        name: info.get_fullname().to_string(),
                        address,
                        port: info.get_port(),
                        serial,
                    };

                    info!("Found device: {} at {}", device.name, device.address);

                    devices.push(device);
                }
            }
            _ => continue,
        }
    }

    info!("Discovery complete. Found {} device(s)", devices.len());
    Ok(devices)
}
