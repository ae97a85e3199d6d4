use crate::profile::{DeviceProfile, ProbeModel};
use serde::{Deserialize, Serialize};
use std::fmt;

/// data point carrying the raw temperature
pub const DP_TEMPERATURE: &str = "101";
/// data point carrying the raw relative humidity
pub const DP_HUMIDITY: &str = "102";

/// raw status payload: data point id -> value
pub type StatusMap = serde_json::Map<String, serde_json::Value>;

/// the one probe this process watches, fixed at startup
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub id: String,
    pub local_key: String,
    pub version: f32,
    pub model: ProbeModel,
    /// friendly name from the registry, if there was one
    pub name: Option<String>,
}

impl DeviceDescriptor {
    pub fn profile(&self) -> DeviceProfile {
        self.model.profile()
    }
}

// keep the local key out of logs
impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("id", &self.id)
            .field("local_key", &"<redacted>")
            .field("version", &self.version)
            .field("model", &self.model)
            .field("name", &self.name)
            .finish()
    }
}

/// one recorded sample, as replayed to late-joining clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// minute-resolution label, e.g. "14:05"
    pub time: String,
    pub temp_f: f64,
    pub temp_c: f64,
    pub humidity: f64,
}

impl Reading {
    /// scale raw data point values with the profile divisors.
    ///
    /// fahrenheit is derived from the unrounded celsius value; all three
    /// results are rounded to one decimal.
    pub fn from_raw(
        raw_temp: f64,
        raw_humidity: f64,
        profile: &DeviceProfile,
        time: String,
    ) -> Self {
        let temp_c = raw_temp / profile.temperature_divisor;
        let humidity = raw_humidity / profile.humidity_divisor;
        Self {
            time,
            temp_f: round1(celsius_to_fahrenheit(temp_c)),
            temp_c: round1(temp_c),
            humidity: round1(humidity),
        }
    }
}

/// numeric data point value; some firmwares send numbers as strings
pub fn dp_number(dps: &StatusMap, id: &str) -> Option<f64> {
    match dps.get(id)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ==============================================================================
// outbound events
// ==============================================================================
// every frame on the websocket is {"event": <name>, "data": <payload>}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProbeEvent {
    History(Vec<Reading>),
    TemperatureUpdate(TemperatureUpdate),
    RescanResult(RescanResult),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TemperatureUpdate {
    Reading {
        temp_f: f64,
        temp_c: f64,
        humidity: f64,
        timestamp: String,
    },
    Scanning {
        scanning: bool,
        timestamp: String,
    },
    Error {
        error: String,
        timestamp: String,
    },
}

impl TemperatureUpdate {
    pub fn reading(reading: &Reading) -> Self {
        TemperatureUpdate::Reading {
            temp_f: reading.temp_f,
            temp_c: reading.temp_c,
            humidity: reading.humidity,
            timestamp: reading.time.clone(),
        }
    }

    pub fn scanning() -> Self {
        TemperatureUpdate::Scanning { scanning: true, timestamp: second_label() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TemperatureUpdate::Error { error: message.into(), timestamp: second_label() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RescanResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RescanResult {
    pub fn found(ip: std::net::IpAddr) -> Self {
        Self { success: true, ip: Some(ip.to_string()), error: None }
    }

    pub fn not_found() -> Self {
        Self { success: false, ip: None, error: Some("Device not found".to_string()) }
    }
}

/// label used for recorded readings
pub fn minute_label() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}

/// label used for scanning and error states
pub fn second_label() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
