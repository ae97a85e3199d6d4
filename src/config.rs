//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     two separate things get configured at startup:
//!     - the host itself (`probe.toml`): bind address, cadence, timeouts,
//!       bridge mode, logging. falls back to defaults when no file exists.
//!     - the probe to watch: from TUYA_* environment variables, or picked out
//!       of a tinytuya `devices.json` registry. no usable probe is fatal.
//!
//! structure:
//!     - ServerConfig:    where the dashboard listens.
//!     - PollingConfig:   cadence, query timeout, failure threshold, history.
//!     - DiscoveryConfig: scan retries and the scan time budget.
//!     - BridgeConfig:    tinytuya subprocess or the simulator.
//!     - LoggingConfig:   default filter and reading echo.
//!     - RegistryConfig:  where devices.json lives.
//!
//! ==============================================================================

use crate::bridge::INTERPRETER_GRACE;
use crate::domain::DeviceDescriptor;
use crate::profile::{is_supported_probe, Identity, ProbeModel};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProbeConfig {
    pub server: ServerConfig,
    pub polling: PollingConfig,
    pub discovery: DiscoveryConfig,
    pub bridge: BridgeConfig,
    pub logging: LoggingConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    pub query_timeout_seconds: u64,
    pub error_threshold: u32,
    pub history_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub max_retries: u32,
    pub scan_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    #[default]
    Tinytuya,
    Simulated,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    pub mode: BridgeMode,
    pub python: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_readings: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:5001".to_string() }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 2,
            query_timeout_seconds: 3,
            error_threshold: 3,
            history_capacity: crate::history::DEFAULT_CAPACITY,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { max_retries: 2, scan_timeout_seconds: 30 }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { mode: BridgeMode::default(), python: "python3".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_readings: true }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("devices.json") }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },

    #[error("failed to parse device registry {path}: {source}")]
    Registry { path: PathBuf, source: serde_json::Error },

    #[error("invalid protocol version '{0}'")]
    InvalidVersion(String),

    #[error("invalid device index '{0}'")]
    InvalidIndex(String),

    #[error(
        "No compatible temperature probe found in {0}.\n\
         Supported devices: ZFX-WT01, ZFX-WT02\n\
         Use TUYA_DEVICE_INDEX=N to select a specific device from the list above."
    )]
    NoProbeInRegistry(PathBuf),

    #[error(
        "No device configuration found. Either:\n  \
           1. Run 'python -m tinytuya wizard' to create devices.json, or\n  \
           2. Set TUYA_DEVICE_ID and TUYA_LOCAL_KEY environment variables\n\n\
         Optional environment variables:\n  \
           TUYA_DEVICE_NAME  - Select device by name from devices.json\n  \
           TUYA_DEVICE_INDEX - Select device by index (0-based)\n  \
           TUYA_DEVICE_TYPE  - Force device type: 'wt01' or 'wt02'\n  \
           TUYA_VERSION      - Protocol version (e.g., '3.4' or '3.5')"
    )]
    NoDevice,
}

/// where the runtime configuration came from
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    /// nothing usable found; carries files that existed but failed to load
    Defaults { skipped: Vec<(PathBuf, ConfigError)> },
}

impl ProbeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Load with default fallback
    pub fn load_or_default() -> (Self, ConfigSource) {
        let paths = [
            PathBuf::from("config").join("probe.toml"),
            PathBuf::from("..").join("config").join("probe.toml"),
        ];

        let mut skipped = Vec::new();
        for path in paths {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return (config, ConfigSource::File(path)),
                    Err(e) => skipped.push((path, e)),
                }
            }
        }

        (Self::default(), ConfigSource::Defaults { skipped })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_seconds.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.query_timeout_seconds.max(1))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.scan_timeout_seconds.max(1))
    }

    /// hard bound on one status query as seen by the poll loop.
    ///
    /// the tinytuya bridge pays for an interpreter start on every query, so
    /// its bound sits above the device socket timeout (and above the cadence
    /// with the defaults: 3s + 2s against 2s).
    pub fn query_bound(&self) -> Duration {
        match self.bridge.mode {
            BridgeMode::Tinytuya => self.query_timeout() + INTERPRETER_GRACE,
            BridgeMode::Simulated => self.query_timeout(),
        }
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        info!("┌─────────────────────────────────────────┐");
        info!("│         PROBE MONITOR SETTINGS          │");
        info!("├─────────────────────────────────────────┤");
        info!("│ Bind: {}", self.server.bind);
        info!("│ Poll Interval: {}s", self.polling.interval_seconds);
        info!("│ Query Timeout: {}s", self.polling.query_timeout_seconds);
        info!("│ Bridge: {:?}", self.bridge.mode);
        info!("│ Log Level: {}", self.logging.level);
        info!("└─────────────────────────────────────────┘");
    }
}

// ==============================================================================
// device resolution
// ==============================================================================

/// the TUYA_* variables that pick the probe
#[derive(Debug, Clone, Default)]
pub struct DeviceEnv {
    pub device_id: Option<String>,
    pub local_key: Option<String>,
    pub version: Option<String>,
    pub device_type: Option<String>,
    pub device_name: Option<String>,
    pub device_index: Option<String>,
}

impl DeviceEnv {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            device_id: var("TUYA_DEVICE_ID"),
            local_key: var("TUYA_LOCAL_KEY"),
            version: var("TUYA_VERSION"),
            device_type: var("TUYA_DEVICE_TYPE"),
            device_name: var("TUYA_DEVICE_NAME"),
            device_index: var("TUYA_DEVICE_INDEX"),
        }
    }

    fn model_override(&self) -> Option<ProbeModel> {
        let raw = self.device_type.as_deref()?;
        match raw.parse() {
            Ok(model) => Some(model),
            Err(e) => {
                warn!("ignoring TUYA_DEVICE_TYPE: {}", e);
                None
            }
        }
    }

    fn version_override(&self) -> Result<Option<f32>, ConfigError> {
        self.version.as_deref().map(parse_version).transpose()
    }
}

/// one device as written by `python -m tinytuya wizard`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryEntry {
    pub id: String,
    pub key: String,
    pub name: String,
    pub model: String,
    pub product_name: String,
    pub version: Option<serde_json::Value>,
}

impl RegistryEntry {
    pub fn identity(&self) -> Identity<'_> {
        Identity { name: &self.name, model: &self.model, product_name: &self.product_name }
    }

    /// the wizard writes "" when it does not know
    fn version(&self) -> Result<Option<f32>, ConfigError> {
        match &self.version {
            Some(serde_json::Value::Number(n)) => Ok(n.as_f64().map(|v| v as f32)),
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                parse_version(s).map(Some)
            }
            _ => Ok(None),
        }
    }
}

fn parse_version(raw: &str) -> Result<f32, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidVersion(raw.to_string()))
}

pub fn load_registry(path: &Path) -> Result<Vec<RegistryEntry>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    serde_json::from_str(&content)
        .map_err(|source| ConfigError::Registry { path: path.to_path_buf(), source })
}

/// resolve exactly one probe: environment first, then the registry
pub fn resolve_device(env: &DeviceEnv, registry: &Path) -> Result<DeviceDescriptor, ConfigError> {
    if let (Some(id), Some(key)) = (&env.device_id, &env.local_key) {
        let model = env.model_override().unwrap_or_default();
        let version = env.version_override()?.unwrap_or(model.profile().default_version);
        return Ok(DeviceDescriptor {
            id: id.clone(),
            local_key: key.clone(),
            version,
            model,
            name: None,
        });
    }

    if registry.exists() {
        let entries = load_registry(registry)?;
        if !entries.is_empty() {
            let index = env
                .device_index
                .as_deref()
                .map(|raw| {
                    raw.trim()
                        .parse::<usize>()
                        .map_err(|_| ConfigError::InvalidIndex(raw.to_string()))
                })
                .transpose()?;

            let entry = select_device(&entries, env.device_name.as_deref(), index)
                .ok_or_else(|| ConfigError::NoProbeInRegistry(registry.to_path_buf()))?;

            let model = env
                .model_override()
                .unwrap_or_else(|| ProbeModel::detect(&entry.identity()));
            let version = match env.version_override()? {
                Some(v) => v,
                None => entry.version()?.unwrap_or(model.profile().default_version),
            };

            let name = if entry.name.is_empty() {
                "Unknown".to_string()
            } else {
                entry.name.clone()
            };
            return Ok(DeviceDescriptor {
                id: entry.id.clone(),
                local_key: entry.key.clone(),
                version,
                model,
                name: Some(name),
            });
        }
    }

    Err(ConfigError::NoDevice)
}

/// pick by name, then by index, then the first supported probe
pub fn select_device<'a>(
    entries: &'a [RegistryEntry],
    name: Option<&str>,
    index: Option<usize>,
) -> Option<&'a RegistryEntry> {
    if let Some(name) = name {
        let wanted = name.to_lowercase();
        let hit = entries.iter().find(|e| {
            e.name.to_lowercase().contains(&wanted)
                || e.model.to_lowercase().contains(&wanted)
                || e.product_name.to_lowercase().contains(&wanted)
                || e.id.to_lowercase() == wanted
        });
        match hit {
            Some(entry) => return Some(entry),
            None => warn!("device '{}' not found", name),
        }
    }

    if let Some(index) = index {
        match entries.get(index) {
            Some(entry) => return Some(entry),
            None => warn!("device index {} out of range", index),
        }
    }

    if let Some(entry) = entries.iter().find(|e| is_supported_probe(&e.identity())) {
        let label = if entry.name.is_empty() { &entry.id } else { &entry.name };
        info!("auto-detected temperature probe: {}", label);
        return Some(entry);
    }

    warn!("no ZFX-WT01/WT02 temperature probe found in registry; available devices:");
    for (i, e) in entries.iter().enumerate() {
        let label = if e.product_name.is_empty() { &e.id } else { &e.product_name };
        let name = if e.name.is_empty() { "Unknown" } else { &e.name };
        warn!("  [{}] {} ({})", i, name, label);
    }
    None
}
