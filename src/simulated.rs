//! ==============================================================================
//! simulated.rs - stand-in probe for machines without one
//! ==============================================================================
//!
//! purpose:
//!     lets the whole host run on a laptop: the scanner "finds" the configured
//!     device on loopback after a short delay, and the status client returns
//!     slowly drifting values in the probe's raw (pre-scaling) units.
//!
//! relationships:
//!     - implements: bridge.rs (Scanner, StatusClient)
//!     - selected by: main.rs (--simulate or bridge.mode = "simulated")
//!
//! ==============================================================================

use crate::bridge::{QueryError, ScanEntry, ScanError, Scanner, StatusClient};
use crate::domain::{DeviceDescriptor, StatusMap, DP_HUMIDITY, DP_TEMPERATURE};

use async_trait::async_trait;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct SimulatedProbe {
    device_id: String,
    scan_delay: Duration,
    samples: AtomicU64,
}

impl SimulatedProbe {
    pub fn new(device_id: impl Into<String>, scan_delay: Duration) -> Self {
        tracing::info!("Using SIMULATED probe (no device access)");
        Self { device_id: device_id.into(), scan_delay, samples: AtomicU64::new(0) }
    }

    /// (celsius, relative humidity) for the n-th sample
    fn sample(n: u64) -> (f64, f64) {
        let t = n as f64 / 30.0;
        (22.0 + 3.0 * t.sin(), 45.0 + 8.0 * (t * 0.7).cos())
    }
}

#[async_trait]
impl Scanner for SimulatedProbe {
    async fn scan(&self, _max_retries: u32) -> Result<Vec<ScanEntry>, ScanError> {
        tokio::time::sleep(self.scan_delay).await;
        Ok(vec![ScanEntry {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            gw_id: self.device_id.clone(),
            product_key: Some("simulated".to_string()),
            version: None,
        }])
    }
}

#[async_trait]
impl StatusClient for SimulatedProbe {
    async fn status(
        &self,
        _address: IpAddr,
        device: &DeviceDescriptor,
    ) -> Result<StatusMap, QueryError> {
        let n = self.samples.fetch_add(1, Ordering::Relaxed);
        let (celsius, humidity) = Self::sample(n);
        let profile = device.profile();

        // the device only ever reports integers
        let mut dps = StatusMap::new();
        let raw_temp = (celsius * profile.temperature_divisor).round() as i64;
        let raw_humidity = (humidity * profile.humidity_divisor).round() as i64;
        dps.insert(DP_TEMPERATURE.into(), json!(raw_temp));
        dps.insert(DP_HUMIDITY.into(), json!(raw_humidity));
        dps.insert("119".into(), json!("c"));
        Ok(dps)
    }
}
