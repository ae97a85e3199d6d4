//! ==============================================================================
//! locator.rs - device address discovery and caching
//! ==============================================================================
//!
//! purpose:
//!     tuya probes get their address from dhcp and happily move around.
//!     the locator keeps the last address we believe in and refreshes it
//!     with a broadcast scan when asked.
//!
//! concurrency:
//!     only one scan runs at a time. the scan gate is a mutex; whoever holds
//!     it is the single writer of the cached address for the duration of the
//!     scan. the poll loop never waits on the gate (it reports "scanning"
//!     instead), the rescan command does.
//!
//! relationships:
//!     - used by: session.rs (poll loop + rescan command)
//!     - uses: bridge.rs (Scanner)
//!
//! ==============================================================================

use crate::bridge::Scanner;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct DeviceLocator {
    device_id: String,
    scanner: Arc<dyn Scanner>,
    max_retries: u32,
    address: RwLock<Option<IpAddr>>,
    scan_gate: Mutex<()>,
    scanning: AtomicBool,
}

/// raised while a scan body runs; lowered on drop, whichever way we leave
struct ScanFlag<'a>(&'a AtomicBool);

impl<'a> ScanFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ScanFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DeviceLocator {
    pub fn new(device_id: impl Into<String>, scanner: Arc<dyn Scanner>, max_retries: u32) -> Self {
        Self {
            device_id: device_id.into(),
            scanner,
            max_retries,
            address: RwLock::new(None),
            scan_gate: Mutex::new(()),
            scanning: AtomicBool::new(false),
        }
    }

    /// last address we believe in, if any
    pub fn address(&self) -> Option<IpAddr> {
        *self.address.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// forget the cached address; the next locate() scans
    pub fn invalidate(&self) {
        self.set_address(None);
    }

    /// forget `stale` only if it is still the cached address.
    ///
    /// returns false when a scan has replaced it in the meantime.
    pub fn invalidate_if(&self, stale: IpAddr) -> bool {
        let mut address = self.address.write().unwrap_or_else(PoisonError::into_inner);
        if *address == Some(stale) {
            *address = None;
            true
        } else {
            false
        }
    }

    /// resolve the device address, scanning if nobody else is.
    ///
    /// when a scan is already in flight this returns the cached address
    /// (possibly none) straight away instead of queueing a second scan.
    pub async fn locate(&self) -> Option<IpAddr> {
        let Ok(_gate) = self.scan_gate.try_lock() else {
            debug!("scan already in progress, not starting another");
            return self.address();
        };
        self.scan_exclusive().await
    }

    /// drop the cached address and scan, waiting out any scan in flight
    pub async fn rescan(&self) -> Option<IpAddr> {
        let _gate = self.scan_gate.lock().await;
        self.invalidate();
        self.scan_exclusive().await
    }

    // caller holds the scan gate
    async fn scan_exclusive(&self) -> Option<IpAddr> {
        let _flag = ScanFlag::raise(&self.scanning);
        info!(device_id = %self.device_id, "scanning network for device");

        let entries = match self.scanner.scan(self.max_retries).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("scan error: {}", e);
                return None;
            }
        };

        match entries.into_iter().find(|e| e.gw_id == self.device_id) {
            Some(entry) => {
                info!(ip = %entry.ip, version = ?entry.version, "found device");
                self.set_address(Some(entry.ip));
                Some(entry.ip)
            }
            None => {
                info!("device not found in scan");
                None
            }
        }
    }

    fn set_address(&self, address: Option<IpAddr>) {
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = address;
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fakes::{entry, FakeScanner};
    use crate::bridge::ScanError;
    use std::time::Duration;

    const ID: &str = "eb4c567f712d29939ctxw3";

    async fn wait_for_scan(locator: &DeviceLocator) {
        for _ in 0..200 {
            if locator.is_scanning() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scan never started");
    }

    #[tokio::test]
    async fn finds_and_caches_matching_device() {
        let scanner = Arc::new(FakeScanner::new(vec![Ok(vec![
            entry("192.168.1.10", "someone-else"),
            entry("192.168.1.42", ID),
        ])]));
        let locator = DeviceLocator::new(ID, scanner, 2);

        assert_eq!(locator.locate().await, Some("192.168.1.42".parse().unwrap()));
        assert_eq!(locator.address(), Some("192.168.1.42".parse().unwrap()));
        assert!(!locator.is_scanning());
    }

    #[tokio::test]
    async fn no_match_returns_none_and_clears_flag() {
        let scanner = Arc::new(FakeScanner::new(vec![Ok(vec![entry("192.168.1.10", "other")])]));
        let locator = DeviceLocator::new(ID, scanner, 2);

        assert_eq!(locator.locate().await, None);
        assert!(!locator.is_scanning());
    }

    #[tokio::test]
    async fn scan_error_is_not_found() {
        let scanner = Arc::new(FakeScanner::new(vec![Err(ScanError::Bridge("no python".into()))]));
        let locator = DeviceLocator::new(ID, scanner, 2);

        assert_eq!(locator.locate().await, None);
        assert!(!locator.is_scanning());
    }

    #[tokio::test]
    async fn concurrent_locate_does_not_start_second_scan() {
        let scanner = Arc::new(FakeScanner::new(vec![Ok(vec![entry("10.0.0.5", ID)])]).gated());
        let locator = Arc::new(DeviceLocator::new(ID, scanner.clone(), 2));

        let first = tokio::spawn({
            let locator = locator.clone();
            async move { locator.locate().await }
        });
        wait_for_scan(&locator).await;

        // returns immediately with what we have, which is nothing yet
        assert_eq!(locator.locate().await, None);
        assert_eq!(locator.locate().await, None);
        assert_eq!(scanner.scan_count(), 1);

        scanner.release_one();
        assert_eq!(first.await.unwrap(), Some("10.0.0.5".parse().unwrap()));
        assert!(!locator.is_scanning());
    }

    #[tokio::test]
    async fn in_flight_scan_reports_stale_address() {
        let scanner = Arc::new(
            FakeScanner::new(vec![Ok(vec![entry("10.0.0.5", ID)]), Ok(Vec::new())]).gated(),
        );
        let locator = Arc::new(DeviceLocator::new(ID, scanner.clone(), 2));
        scanner.release_one();
        locator.locate().await;

        let second = tokio::spawn({
            let locator = locator.clone();
            async move { locator.locate().await }
        });
        wait_for_scan(&locator).await;
        assert_eq!(locator.locate().await, Some("10.0.0.5".parse().unwrap()));

        scanner.release_one();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_scan_lowers_flag() {
        let scanner = Arc::new(FakeScanner::default().gated());
        let locator = Arc::new(DeviceLocator::new(ID, scanner, 2));

        let task = tokio::spawn({
            let locator = locator.clone();
            async move { locator.locate().await }
        });
        wait_for_scan(&locator).await;
        task.abort();
        let _ = task.await;

        assert!(!locator.is_scanning());
    }

    #[tokio::test]
    async fn rescan_clears_then_rediscovers() {
        let scanner = Arc::new(FakeScanner::new(vec![
            Ok(vec![entry("10.0.0.5", ID)]),
            Ok(vec![entry("10.0.0.9", ID)]),
            Ok(Vec::new()),
        ]));
        let locator = DeviceLocator::new(ID, scanner, 2);

        locator.locate().await;
        assert_eq!(locator.rescan().await, Some("10.0.0.9".parse().unwrap()));
        assert_eq!(locator.rescan().await, None);
        assert_eq!(locator.address(), None);
    }

    #[tokio::test]
    async fn invalidate_if_leaves_newer_address_alone() {
        let scanner = Arc::new(FakeScanner::new(vec![
            Ok(vec![entry("10.0.0.5", ID)]),
            Ok(vec![entry("10.0.0.9", ID)]),
        ]));
        let locator = DeviceLocator::new(ID, scanner, 2);

        locator.locate().await;
        locator.rescan().await;
        assert!(!locator.invalidate_if("10.0.0.5".parse().unwrap()));
        assert_eq!(locator.address(), Some("10.0.0.9".parse().unwrap()));

        assert!(locator.invalidate_if("10.0.0.9".parse().unwrap()));
        assert_eq!(locator.address(), None);
    }

    #[tokio::test]
    async fn rescan_waits_for_scan_in_flight() {
        let scanner = Arc::new(
            FakeScanner::new(vec![Ok(Vec::new()), Ok(vec![entry("10.0.0.7", ID)])]).gated(),
        );
        let locator = Arc::new(DeviceLocator::new(ID, scanner.clone(), 2));

        let polling = tokio::spawn({
            let locator = locator.clone();
            async move { locator.locate().await }
        });
        wait_for_scan(&locator).await;

        let rescan = tokio::spawn({
            let locator = locator.clone();
            async move { locator.rescan().await }
        });

        scanner.release_one();
        scanner.release_one();
        assert_eq!(polling.await.unwrap(), None);
        assert_eq!(rescan.await.unwrap(), Some("10.0.0.7".parse().unwrap()));
        assert_eq!(scanner.scan_count(), 2);
    }
}
