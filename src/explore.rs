//! ==============================================================================
//! explore.rs - one-shot scan and status commands
//! ==============================================================================
//!
//! purpose:
//!     the tools you reach for while setting a probe up, before the dashboard
//!     is of any use:
//!     - `probe-monitor scan`   lists every tuya device answering on the lan
//!     - `probe-monitor status` finds the configured probe once and dumps all
//!       of its data points, sorted by id
//!
//!     both go through the same Scanner / StatusClient as the poll loop, so
//!     `--simulate` works here too.
//!
//! relationships:
//!     - used by: main.rs (subcommands)
//!     - uses: bridge.rs, locator.rs, domain.rs
//!
//! ==============================================================================

use crate::bridge::{query_with_timeout, QueryError, ScanEntry, ScanError, Scanner, StatusClient};
use crate::domain::{dp_number, DeviceDescriptor, StatusMap, DP_HUMIDITY, DP_TEMPERATURE};
use crate::locator::DeviceLocator;

use std::fmt::Write;
use std::net::IpAddr;
use std::time::Duration;

/// unit flag reported by the probe ("c" / "f")
const DP_UNIT: &str = "119";
/// probe operating mode
const DP_MODE: &str = "115";

#[derive(Debug, thiserror::Error)]
pub enum ExploreError {
    #[error("Device not found on network")]
    NotFound,
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// everything heard on the lan, ordered by address
pub async fn scan_network(
    scanner: &dyn Scanner,
    max_retries: u32,
) -> Result<Vec<ScanEntry>, ExploreError> {
    let mut entries = scanner.scan(max_retries).await?;
    entries.sort_by_key(|e| e.ip);
    Ok(entries)
}

pub fn render_scan(entries: &[ScanEntry]) -> String {
    if entries.is_empty() {
        return "No devices found. Make sure devices are on the same network.\n".to_string();
    }

    let mut out = format!("Found {} device(s):\n", entries.len());
    for e in entries {
        let _ = writeln!(out);
        let _ = writeln!(out, "  IP: {}", e.ip);
        let _ = writeln!(out, "  Device ID: {}", or_na(Some(e.gw_id.as_str())));
        let _ = writeln!(out, "  Product Key: {}", or_na(e.product_key.as_deref()));
        let _ = writeln!(out, "  Version: {}", or_na(e.version.as_deref()));
    }
    out
}

fn or_na(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => "N/A",
    }
}

#[derive(Debug)]
pub struct StatusDump {
    pub address: IpAddr,
    pub dps: StatusMap,
}

/// locate the probe once and read its full status
pub async fn read_status(
    locator: &DeviceLocator,
    client: &dyn StatusClient,
    device: &DeviceDescriptor,
    limit: Duration,
) -> Result<StatusDump, ExploreError> {
    let address = locator.locate().await.ok_or(ExploreError::NotFound)?;
    let dps = query_with_timeout(client, address, device, limit).await?;
    Ok(StatusDump { address, dps })
}

pub fn render_status(device: &DeviceDescriptor, dump: &StatusDump) -> String {
    let profile = device.profile();
    let mut out = String::new();
    let _ = writeln!(out, "{} at {}", profile.display_name, dump.address);
    let _ = writeln!(out);

    if let Some(raw) = dp_number(&dump.dps, DP_TEMPERATURE) {
        let unit = dump.dps.get(DP_UNIT).and_then(|v| v.as_str()).unwrap_or("c").to_uppercase();
        let _ = writeln!(out, "Temperature: {}°{}", raw / profile.temperature_divisor, unit);
    }
    if let Some(raw) = dp_number(&dump.dps, DP_HUMIDITY) {
        let _ = writeln!(out, "Humidity:    {}%", raw / profile.humidity_divisor);
    }
    if let Some(mode) = dump.dps.get(DP_MODE) {
        let _ = writeln!(out, "Mode:        {}", display_value(mode));
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "--- All Data Points ---");
    for (id, value) in sorted_dps(&dump.dps) {
        let _ = writeln!(out, "  DP {:>3}: {}", id, display_value(value));
    }
    out
}

/// numeric ids in numeric order, anything else after them
fn sorted_dps(dps: &StatusMap) -> Vec<(&String, &serde_json::Value)> {
    let mut items: Vec<_> = dps.iter().collect();
    items.sort_by_key(|(id, _)| (id.parse::<u64>().unwrap_or(u64::MAX), id.to_string()));
    items
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fakes::{dps, entry, FakeScanner, ScriptedClient};
    use crate::profile::ProbeModel;
    use serde_json::json;
    use std::sync::Arc;

    const ID: &str = "eb4c567f712d29939ctxw3";
    const LIMIT: Duration = Duration::from_millis(200);

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            id: ID.into(),
            local_key: "key".into(),
            version: 3.4,
            model: ProbeModel::Wt02,
            name: None,
        }
    }

    #[tokio::test]
    async fn scan_lists_every_device_by_address() {
        let mut plug = entry("192.168.1.50", "plug01");
        plug.product_key = Some("keyplug".into());
        let scanner = FakeScanner::new(vec![Ok(vec![plug, entry("192.168.1.7", ID)])]);

        let found = scan_network(&scanner, 2).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].gw_id, ID);

        let text = render_scan(&found);
        assert!(text.starts_with("Found 2 device(s):"));
        assert!(text.contains("IP: 192.168.1.50"));
        assert!(text.contains("Product Key: keyplug"));
        assert!(text.contains("Product Key: N/A"));
    }

    #[tokio::test]
    async fn empty_scan_says_so() {
        let scanner = FakeScanner::default();
        let found = scan_network(&scanner, 2).await.unwrap();
        assert!(render_scan(&found).starts_with("No devices found"));
    }

    #[tokio::test]
    async fn scan_failure_is_reported() {
        let scanner = FakeScanner::new(vec![Err(ScanError::Bridge("no python".into()))]);
        assert!(matches!(scan_network(&scanner, 2).await, Err(ExploreError::Scan(_))));
    }

    #[tokio::test]
    async fn status_dumps_all_data_points_in_numeric_order() {
        let scanner = Arc::new(FakeScanner::new(vec![Ok(vec![entry("10.0.0.5", ID)])]));
        let mut payload = dps(231, 455);
        payload.insert("9".into(), json!(true));
        payload.insert("119".into(), json!("f"));
        payload.insert("115".into(), json!("bbq"));
        let client = ScriptedClient::new(vec![Ok(payload)]);
        let locator = DeviceLocator::new(ID, scanner, 2);

        let dump = read_status(&locator, &client, &device(), LIMIT).await.unwrap();
        assert_eq!(dump.address, "10.0.0.5".parse::<IpAddr>().unwrap());

        let text = render_status(&device(), &dump);
        assert!(text.contains("Temperature: 23.1°F"));
        assert!(text.contains("Humidity:    45.5%"));
        assert!(text.contains("Mode:        bbq"));

        let order: Vec<_> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix("DP "))
            .map(|l| l.split(':').next().unwrap_or("").trim().to_string())
            .collect();
        assert_eq!(order, ["9", "101", "102", "115", "119"]);
    }

    #[tokio::test]
    async fn status_without_device_is_not_found() {
        let scanner = Arc::new(FakeScanner::new(vec![Ok(vec![entry("10.0.0.5", "other")])]));
        let client = ScriptedClient::default();
        let locator = DeviceLocator::new(ID, scanner, 2);

        let err = read_status(&locator, &client, &device(), LIMIT).await.unwrap_err();
        assert!(matches!(err, ExploreError::NotFound));
        assert_eq!(client.query_count(), 0);
    }

    #[tokio::test]
    async fn status_query_errors_pass_through() {
        let scanner = Arc::new(FakeScanner::new(vec![Ok(vec![entry("10.0.0.5", ID)])]));
        let refusal = QueryError::from_code("914", "Check device key");
        let client = ScriptedClient::new(vec![Err(refusal)]);
        let locator = DeviceLocator::new(ID, scanner, 2);

        let err = read_status(&locator, &client, &device(), LIMIT).await.unwrap_err();
        assert!(err.to_string().contains("914"));
    }
}
