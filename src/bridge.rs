//! ==============================================================================
//! bridge.rs - device capability boundary
//! ==============================================================================
//!
//! purpose:
//!     everything that actually speaks the tuya local protocol lives behind
//!     two traits:
//!     - Scanner:      "who is broadcasting on this network?"
//!     - StatusClient: "given id + key + address + version, what are your dps?"
//!
//!     the production implementation delegates both to tinytuya in a short
//!     lived python3 subprocess. the encrypted session, key handling and
//!     protocol versions stay inside that library; we only see json.
//!
//! why subprocess to python?:
//!     the tuya local protocol has four incompatible revisions (3.1 - 3.5)
//!     with different framing and ciphers. tinytuya tracks them; we do not
//!     want to. one process per call also means a wedged session cannot
//!     outlive its timeout (the child is killed on drop).
//!
//! relationships:
//!     - used by: locator.rs (Scanner)
//!     - used by: session.rs (StatusClient, query_with_timeout)
//!     - alternative: simulated.rs (no hardware)
//!
//! ==============================================================================

use crate::domain::{DeviceDescriptor, StatusMap};

use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;

// ==============================================================================
// capability traits
// ==============================================================================

/// one device heard during a broadcast scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEntry {
    pub ip: IpAddr,
    pub gw_id: String,
    pub product_key: Option<String>,
    pub version: Option<String>,
}

#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, max_retries: u32) -> Result<Vec<ScanEntry>, ScanError>;
}

#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn status(
        &self,
        address: IpAddr,
        device: &DeviceDescriptor,
    ) -> Result<StatusMap, QueryError>;
}

// ==============================================================================
// failure classification
// ==============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// could not open a session at all; the cached address is suspect
    #[error("connection failed ({code}): {message}")]
    Session { code: String, message: String },

    /// the device answered but refused the request (bad key, wrong version...)
    #[error("device error ({code}): {message}")]
    Device { code: String, message: String },

    #[error("device did not answer in time")]
    Timeout,

    #[error("{0}")]
    Transient(String),
}

impl QueryError {
    /// map a tinytuya error code onto our classes
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            // ERR_CONNECT, ERR_OFFLINE
            "901" | "905" => QueryError::Session { code: code.to_string(), message },
            // ERR_TIMEOUT
            "902" => QueryError::Timeout,
            _ => QueryError::Device { code: code.to_string(), message },
        }
    }

    /// whether repeated occurrences should drop the cached address.
    ///
    /// unclassified failures count here too: we cannot tell they are not
    /// a dead address.
    pub fn suggests_rediscovery(&self) -> bool {
        !matches!(self, QueryError::Device { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    #[error("scan did not finish within {0:?}")]
    Timeout(Duration),
    #[error("scan failed: {0}")]
    Bridge(String),
}

/// run a status query with a hard upper bound, whatever the client does
pub async fn query_with_timeout(
    client: &dyn StatusClient,
    address: IpAddr,
    device: &DeviceDescriptor,
    limit: Duration,
) -> Result<StatusMap, QueryError> {
    match tokio::time::timeout(limit, client.status(address, device)).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout),
    }
}

// ==============================================================================
// tinytuya bridge
// ==============================================================================

const SCAN_SCRIPT: &str = r#"
import json, sys
import tinytuya
found = tinytuya.deviceScan(verbose=False, maxretry=int(sys.argv[1]))
print(json.dumps([
    {"ip": ip, "gwId": info.get("gwId"), "productKey": info.get("productKey"),
     "version": info.get("version")}
    for ip, info in found.items()
]))
"#;

// the local key travels via the environment so it never shows up in `ps`
const STATUS_SCRIPT: &str = r#"
import json, os, sys
import tinytuya
dev_id, address, version, timeout = sys.argv[1:5]
d = tinytuya.Device(dev_id=dev_id, address=address,
                    local_key=os.environ["PROBE_LOCAL_KEY"], version=float(version))
d.set_socketTimeout(float(timeout))
print(json.dumps(d.status()))
"#;

/// room for the interpreter to start on top of the device socket timeout
pub const INTERPRETER_GRACE: Duration = Duration::from_secs(2);

pub struct TinytuyaBridge {
    python: String,
    socket_timeout: Duration,
    scan_timeout: Duration,
}

impl TinytuyaBridge {
    pub fn new(
        python: impl Into<String>,
        socket_timeout: Duration,
        scan_timeout: Duration,
    ) -> Self {
        Self { python: python.into(), socket_timeout, scan_timeout }
    }

    async fn run(
        &self,
        script: &str,
        args: &[String],
        env: Option<(&str, &str)>,
        limit: Duration,
    ) -> Result<String, RunError> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-c").arg(script).args(args).kill_on_drop(true);
        if let Some((key, value)) = env {
            cmd.env(key, value);
        }

        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| RunError::TimedOut)?
            .map_err(|e| RunError::Failed(format!("failed to run {}: {}", self.python, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output");
            let reason = format!("bridge exited with {}: {}", output.status, last.trim());
            return Err(RunError::Failed(reason));
        }

        Ok(last_line(&String::from_utf8_lossy(&output.stdout)))
    }
}

enum RunError {
    TimedOut,
    Failed(String),
}

#[async_trait]
impl Scanner for TinytuyaBridge {
    async fn scan(&self, max_retries: u32) -> Result<Vec<ScanEntry>, ScanError> {
        let out = self
            .run(SCAN_SCRIPT, &[max_retries.to_string()], None, self.scan_timeout)
            .await
            .map_err(|e| match e {
                RunError::TimedOut => ScanError::Timeout(self.scan_timeout),
                RunError::Failed(msg) => ScanError::Bridge(msg),
            })?;
        parse_scan_output(&out)
    }
}

#[async_trait]
impl StatusClient for TinytuyaBridge {
    async fn status(
        &self,
        address: IpAddr,
        device: &DeviceDescriptor,
    ) -> Result<StatusMap, QueryError> {
        let args = [
            device.id.clone(),
            address.to_string(),
            device.version.to_string(),
            self.socket_timeout.as_secs_f32().to_string(),
        ];
        let limit = self.socket_timeout + INTERPRETER_GRACE;
        let out = self
            .run(STATUS_SCRIPT, &args, Some(("PROBE_LOCAL_KEY", device.local_key.as_str())), limit)
            .await
            .map_err(|e| match e {
                RunError::TimedOut => QueryError::Timeout,
                RunError::Failed(msg) => QueryError::Transient(msg),
            })?;
        parse_status_output(&out)
    }
}

// ==============================================================================
// output parsing
// ==============================================================================

#[derive(Deserialize)]
struct RawScanEntry {
    ip: String,
    #[serde(rename = "gwId")]
    gw_id: Option<String>,
    #[serde(rename = "productKey")]
    product_key: Option<String>,
    version: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawStatus {
    #[serde(rename = "Error")]
    error: Option<String>,
    #[serde(rename = "Err")]
    err: Option<serde_json::Value>,
    dps: Option<StatusMap>,
}

fn last_line(stdout: &str) -> String {
    stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_scan_output(out: &str) -> Result<Vec<ScanEntry>, ScanError> {
    let raw: Vec<RawScanEntry> = serde_json::from_str(out)
        .map_err(|e| ScanError::Bridge(format!("unreadable scan output: {}", e)))?;

    Ok(raw
        .into_iter()
        .filter_map(|r| {
            let ip = r.ip.parse().ok()?;
            Some(ScanEntry {
                ip,
                gw_id: r.gw_id.unwrap_or_default(),
                product_key: r.product_key,
                version: r.version.as_ref().map(value_to_string),
            })
        })
        .collect())
}

fn parse_status_output(out: &str) -> Result<StatusMap, QueryError> {
    let raw: RawStatus = serde_json::from_str(out)
        .map_err(|e| QueryError::Transient(format!("unreadable status output: {}", e)))?;

    if let Some(message) = raw.error {
        let code = raw.err.as_ref().map(value_to_string).unwrap_or_default();
        return Err(QueryError::from_code(&code, message));
    }

    Ok(raw.dps.unwrap_or_default())
}


// ==============================================================================
// in-memory fakes shared by the test suites
// ==============================================================================
#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Semaphore;

    /// records which capability was called, in order
    pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

    /// answers scans from a canned list (empty once exhausted)
    #[derive(Default)]
    pub struct FakeScanner {
        results: Mutex<VecDeque<Result<Vec<ScanEntry>, ScanError>>>,
        pub scans: AtomicUsize,
        pub release: Option<Semaphore>,
        log: Option<CallLog>,
    }

    impl FakeScanner {
        pub fn new(results: Vec<Result<Vec<ScanEntry>, ScanError>>) -> Self {
            Self { results: Mutex::new(results.into()), ..Default::default() }
        }

        /// every scan blocks until a permit is added to `release`
        pub fn gated(mut self) -> Self {
            self.release = Some(Semaphore::new(0));
            self
        }

        pub fn logging(mut self, log: CallLog) -> Self {
            self.log = Some(log);
            self
        }

        pub fn scan_count(&self) -> usize {
            self.scans.load(Ordering::SeqCst)
        }

        pub fn release_one(&self) {
            if let Some(gate) = &self.release {
                gate.add_permits(1);
            }
        }
    }

    #[async_trait]
    impl Scanner for FakeScanner {
        async fn scan(&self, _max_retries: u32) -> Result<Vec<ScanEntry>, ScanError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.log {
                log.lock().unwrap().push("scan");
            }
            if let Some(gate) = &self.release {
                gate.acquire().await.expect("semaphore open").forget();
            }
            self.results.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// answers status queries from a script
    #[derive(Default)]
    pub struct ScriptedClient {
        script: Mutex<VecDeque<Result<StatusMap, QueryError>>>,
        pub queries: AtomicUsize,
        release: Option<Semaphore>,
        log: Option<CallLog>,
    }

    impl ScriptedClient {
        pub fn new(script: Vec<Result<StatusMap, QueryError>>) -> Self {
            Self { script: Mutex::new(script.into()), ..Default::default() }
        }

        pub fn logging(mut self, log: CallLog) -> Self {
            self.log = Some(log);
            self
        }

        /// every query blocks until `release_one`
        pub fn gated(mut self) -> Self {
            self.release = Some(Semaphore::new(0));
            self
        }

        pub fn release_one(&self) {
            if let Some(gate) = &self.release {
                gate.add_permits(1);
            }
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusClient for ScriptedClient {
        async fn status(
            &self,
            _address: IpAddr,
            _device: &DeviceDescriptor,
        ) -> Result<StatusMap, QueryError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.log {
                log.lock().unwrap().push("query");
            }
            if let Some(gate) = &self.release {
                gate.acquire().await.expect("semaphore open").forget();
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(QueryError::Transient("script exhausted".into())))
        }
    }

    pub fn entry(ip: &str, id: &str) -> ScanEntry {
        ScanEntry {
            ip: ip.parse().unwrap(),
            gw_id: id.into(),
            product_key: None,
            version: Some("3.4".into()),
        }
    }

    pub fn dps(temp: i64, humidity: i64) -> StatusMap {
        let mut map = StatusMap::new();
        map.insert("101".into(), temp.into());
        map.insert("102".into(), humidity.into());
        map
    }
}
