//! ==============================================================================
//! session.rs - the probe polling session
//! ==============================================================================
//!
//! purpose:
//!     one shared object that owns everything the poll loop and the dashboard
//!     need: the device descriptor, the locator, the status client and the
//!     live hub. the poll loop runs `tick()` on a fixed cadence; the rescan
//!     command calls `rescan()` from whatever task received it.
//!
//! tick:
//!
//!     scanning? ──yes──> emit {scanning}                     (no query)
//!        │no
//!     address? ──no───> locate ──none──> emit {error: not found}
//!        │yes                │found
//!        ▼                   ▼
//!     query (bounded) ──ok──> scale dps ─> record + emit reading
//!        │err
//!        ▼
//!     count it; after `error_threshold` address-suspect failures in a row
//!     forget the address so the next tick rediscovers; emit {error}.
//!     a device refusal proves the address is right and restarts the count.
//!
//! relationships:
//!     - used by: main.rs (spawns the loop), server.rs (rescan, status)
//!     - uses: locator.rs, bridge.rs, hub.rs
//!
//! ==============================================================================

use crate::bridge::{query_with_timeout, QueryError, StatusClient};
use crate::domain::{
    dp_number, minute_label, DeviceDescriptor, ProbeEvent, Reading, RescanResult, StatusMap,
    TemperatureUpdate, DP_HUMIDITY, DP_TEMPERATURE,
};
use crate::hub::LiveHub;
use crate::locator::DeviceLocator;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NOT_FOUND: &str = "Device not found on network";
pub const NO_DATA: &str = "No temperature data in device response";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub interval: Duration,
    /// hard bound on a single status query.
    ///
    /// with the tinytuya bridge this is the device socket timeout plus the
    /// interpreter start-up grace, so it can exceed the cadence; a slow tick
    /// delays the next one rather than overlapping it.
    pub query_timeout: Duration,
    pub error_threshold: u32,
    pub show_readings: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            query_timeout: Duration::from_secs(3),
            error_threshold: 3,
            show_readings: true,
        }
    }
}

/// what a single tick did, mostly for logs and tests
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Scanning,
    NotFound,
    Recorded(Reading),
    NoData,
    Failed { error: QueryError, rediscover: bool },
}

pub struct ProbeSession {
    device: DeviceDescriptor,
    locator: DeviceLocator,
    client: Arc<dyn StatusClient>,
    hub: LiveHub,
    settings: SessionSettings,
    // only the poll loop writes this
    consecutive_errors: AtomicU32,
    // a client rescan is queued or running
    rescan_pending: AtomicBool,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub device_id: String,
    pub device_name: Option<String>,
    pub model: String,
    pub protocol_version: f32,
    pub address: Option<String>,
    pub scanning: bool,
    pub consecutive_errors: u32,
    pub history_len: usize,
    pub history_capacity: usize,
    pub clients: usize,
}

impl ProbeSession {
    pub fn new(
        device: DeviceDescriptor,
        locator: DeviceLocator,
        client: Arc<dyn StatusClient>,
        hub: LiveHub,
        settings: SessionSettings,
    ) -> Self {
        Self {
            device,
            locator,
            client,
            hub,
            settings,
            consecutive_errors: AtomicU32::new(0),
            rescan_pending: AtomicBool::new(false),
        }
    }

    pub fn locator(&self) -> &DeviceLocator {
        &self.locator
    }

    pub fn hub(&self) -> &LiveHub {
        &self.hub
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            device_id: self.device.id.clone(),
            device_name: self.device.name.clone(),
            model: self.device.profile().display_name.to_string(),
            protocol_version: self.device.version,
            address: self.locator.address().map(|a| a.to_string()),
            scanning: self.locator.is_scanning(),
            consecutive_errors: self.consecutive_errors(),
            history_len: self.hub.history_len(),
            history_capacity: self.hub.history_capacity(),
            clients: self.hub.client_count(),
        }
    }

    // ==========================================================================
    // poll loop
    // ==========================================================================

    /// run ticks on the cadence until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut cadence = tokio::time::interval(self.settings.interval);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("polling every {:?}", self.settings.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = cadence.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.tick() => debug!(?outcome, "tick"),
            }
        }

        info!("polling stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(shutdown))
    }

    /// one cadence step. never fails: every problem becomes an event
    pub async fn tick(&self) -> TickOutcome {
        if self.locator.is_scanning() {
            self.emit(TemperatureUpdate::scanning());
            return TickOutcome::Scanning;
        }

        let address = match self.locator.address() {
            Some(address) => address,
            None => match self.locator.locate().await {
                Some(address) => address,
                None => {
                    self.emit(TemperatureUpdate::error(NOT_FOUND));
                    return TickOutcome::NotFound;
                }
            },
        };

        let limit = self.settings.query_timeout;
        match query_with_timeout(&*self.client, address, &self.device, limit).await {
            Ok(dps) => {
                // the device answered, whatever it said
                self.consecutive_errors.store(0, Ordering::SeqCst);
                match self.interpret(&dps) {
                    Some(reading) => {
                        if self.settings.show_readings {
                            info!(
                                "Temp: {:.1}°C / {:.1}°F | Humidity: {:.1}%",
                                reading.temp_c, reading.temp_f, reading.humidity
                            );
                        }
                        self.hub.record(reading.clone());
                        TickOutcome::Recorded(reading)
                    }
                    None => {
                        warn!(?dps, "status had no temperature data points");
                        self.emit(TemperatureUpdate::error(NO_DATA));
                        TickOutcome::NoData
                    }
                }
            }
            Err(error) => self.on_failure(address, error),
        }
    }

    fn on_failure(&self, address: IpAddr, error: QueryError) -> TickOutcome {
        if !error.suggests_rediscovery() {
            // the device answered, so the address is good
            self.consecutive_errors.store(0, Ordering::SeqCst);
            warn!("device refused status query: {}", error);
            self.emit(TemperatureUpdate::error(error.to_string()));
            return TickOutcome::Failed { error, rediscover: false };
        }

        let failures = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(failures, "status query failed: {}", error);

        let mut rediscover = false;
        if failures >= self.settings.error_threshold {
            self.consecutive_errors.store(0, Ordering::SeqCst);
            // a rescan may have replaced the address while we were querying it
            rediscover = self.locator.invalidate_if(address);
            if rediscover {
                warn!("{} consecutive failures, re-scanning network on next tick", failures);
            }
        }

        self.emit(TemperatureUpdate::error(error.to_string()));
        TickOutcome::Failed { error, rediscover }
    }

    fn interpret(&self, dps: &StatusMap) -> Option<Reading> {
        let raw_temp = dp_number(dps, DP_TEMPERATURE)?;
        let raw_humidity = dp_number(dps, DP_HUMIDITY)?;
        Some(Reading::from_raw(raw_temp, raw_humidity, &self.device.profile(), minute_label()))
    }

    fn emit(&self, update: TemperatureUpdate) {
        self.hub.publish(ProbeEvent::TemperatureUpdate(update));
    }

    // ==========================================================================
    // rescan command
    // ==========================================================================

    /// forget the address and scan now, outside the cadence.
    ///
    /// publishes exactly one rescan_result and returns it as well.
    pub async fn rescan(&self) -> RescanResult {
        info!("rescan requested by client");
        let result = match self.locator.rescan().await {
            Some(address) => RescanResult::found(address),
            None => RescanResult::not_found(),
        };
        self.hub.publish(ProbeEvent::RescanResult(result.clone()));
        result
    }

    /// fire-and-forget rescan for websocket clients.
    ///
    /// requests arriving while one is queued or running are merged into it;
    /// everyone gets that rescan's broadcast result. returns whether a new
    /// rescan was started.
    pub fn request_rescan(self: &Arc<Self>) -> bool {
        if self
            .rescan_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("rescan already pending, merging request");
            return false;
        }

        let session = self.clone();
        tokio::spawn(async move {
            session.rescan().await;
            session.rescan_pending.store(false, Ordering::SeqCst);
        });
        true
    }
}
