//! ==============================================================================
//! profile.rs - probe model classification
//! ==============================================================================
//!
//! purpose:
//!     the zfx-wt01 and zfx-wt02 probes speak the same protocol but report
//!     temperature on different scales. this module decides which one we are
//!     talking to and hands out the matching scaling profile.
//!
//! relationships:
//!     - used by: config.rs (device selection from the registry)
//!     - used by: session.rs (divisors applied to raw data points)
//!
//! ==============================================================================

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// scaling and metadata for one hardware variant
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub display_name: &'static str,
    pub temperature_divisor: f64,
    pub humidity_divisor: f64,
    pub default_version: f32,
}

/// the closed set of supported probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeModel {
    /// k-type thermocouple, reports whole degrees
    Wt01,
    /// ntc thermistor, reports tenths of a degree
    #[default]
    Wt02,
}

const WT01_MARKERS: [&str; 2] = ["WT01", "WT-01"];
const WT02_MARKERS: [&str; 2] = ["WT02", "WT-02"];

impl ProbeModel {
    pub fn profile(self) -> DeviceProfile {
        match self {
            ProbeModel::Wt01 => DeviceProfile {
                display_name: "ZFX-WT01 (K-type thermocouple)",
                temperature_divisor: 1.0,
                humidity_divisor: 10.0,
                default_version: 3.5,
            },
            ProbeModel::Wt02 => DeviceProfile {
                display_name: "ZFX-WT02 (NTC thermistor)",
                temperature_divisor: 10.0,
                humidity_divisor: 10.0,
                default_version: 3.4,
            },
        }
    }

    /// classify from free-text identity fields.
    ///
    /// falls back to wt02 when nothing matches; older setups only ever had
    /// the wt02 and relied on that.
    pub fn detect(identity: &Identity<'_>) -> Self {
        Self::match_markers(identity).unwrap_or_default()
    }

    fn match_markers(identity: &Identity<'_>) -> Option<Self> {
        let combined = identity.combined();
        if WT01_MARKERS.iter().any(|m| combined.contains(m)) {
            Some(ProbeModel::Wt01)
        } else if WT02_MARKERS.iter().any(|m| combined.contains(m)) {
            Some(ProbeModel::Wt02)
        } else {
            None
        }
    }
}

/// true when the fields name any supported probe
pub fn is_supported_probe(identity: &Identity<'_>) -> bool {
    ProbeModel::match_markers(identity).is_some()
}

impl FromStr for ProbeModel {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wt01" => Ok(ProbeModel::Wt01),
            "wt02" => Ok(ProbeModel::Wt02),
            _ => Err(UnknownModel(s.to_string())),
        }
    }
}

impl fmt::Display for ProbeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeModel::Wt01 => f.write_str("wt01"),
            ProbeModel::Wt02 => f.write_str("wt02"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown probe model '{0}' (expected wt01 or wt02)")]
pub struct UnknownModel(pub String);

/// the identifying text of a device as found in the registry
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity<'a> {
    pub name: &'a str,
    pub model: &'a str,
    pub product_name: &'a str,
}

impl Identity<'_> {
    fn combined(&self) -> String {
        format!("{} {} {}", self.name, self.model, self.product_name).to_uppercase()
    }
}
