//! ==============================================================================
//! main.rs - probe monitor entry point
//! ==============================================================================
//!
//! purpose:
//!     watches one tuya WT01/WT02 wireless temperature probe on the lan and
//!     streams its readings to any number of browser dashboards.
//!
//! commands:
//!     (none)   poll the probe and serve the dashboard
//!     scan     list every tuya device on the lan and exit
//!     status   read the probe once, print all data points and exit
//!
//! responsibilities:
//!     - load probe.toml and resolve which probe to watch (fatal if none)
//!     - pick the device bridge (tinytuya subprocess or simulator)
//!     - find the probe once before polling starts
//!     - run the poll loop and the web server side by side
//!     - stop both cleanly on ctrl-c
//!
//! relationships:
//!     - uses: config.rs (probe.toml + device resolution)
//!     - uses: session.rs (poll loop, rescan)
//!     - uses: server.rs (dashboard, websocket, api)
//!     - uses: explore.rs (scan / status commands)
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    rust host (this file)                    │
//!     │  ┌─────────────┐                      ┌─────────────────┐   │
//!     │  │ poll loop   │ ── readings/events ─>│ web server      │   │
//!     │  │ (2s cycle)  │ <──── rescan ─────── │ (port 5001, ws) │   │
//!     │  └──────┬──────┘                      └─────────────────┘   │
//!     │         │ scan / status                                     │
//!     └─────────┼───────────────────────────────────────────────────┘
//!               ▼
//!        ┌─────────────┐         ┌─────────────┐
//!        │ python3 +   │ ──────> │  WT02 probe │
//!        │ tinytuya    │  lan    │  (wifi)     │
//!        └─────────────┘         └─────────────┘
//!
//! ==============================================================================

mod bridge;
mod config;
mod domain;
mod explore;
mod history;
mod hub;
mod locator;
mod profile;
mod server;
mod session;
mod simulated;

use crate::bridge::{Scanner, StatusClient, TinytuyaBridge};
use crate::config::{BridgeMode, ConfigError, ConfigSource, DeviceEnv, ProbeConfig};
use crate::domain::DeviceDescriptor;
use crate::hub::LiveHub;
use crate::locator::DeviceLocator;
use crate::profile::ProbeModel;
use crate::session::{ProbeSession, SessionSettings};
use crate::simulated::SimulatedProbe;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SIMULATED_DEVICE_ID: &str = "simulated-probe";

#[derive(Parser, Debug)]
#[command(
    name = "probe-monitor",
    version,
    about = "Live dashboard for a Tuya WT01/WT02 temperature probe"
)]
struct Args {
    /// path to probe.toml (otherwise config/probe.toml, then ../config/probe.toml)
    #[arg(long, env = "PROBE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// listen address, overrides [server] bind
    #[arg(long, env = "PROBE_BIND")]
    bind: Option<String>,

    /// use the built-in simulated probe instead of tinytuya
    #[arg(long, global = true)]
    simulate: bool,

    /// debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// list every tuya device answering on the local network
    Scan,
    /// find the configured probe once and print all of its data points
    Status,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // step 1: load configuration (logging is not up yet, so remember where it came from)
    let (mut config, source) = match &args.config {
        Some(path) => (ProbeConfig::load(path)?, ConfigSource::File(path.clone())),
        None => ProbeConfig::load_or_default(),
    };
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if args.simulate {
        config.bridge.mode = BridgeMode::Simulated;
    }

    init_logging(&config.logging.level, args.verbose);

    match source {
        ConfigSource::File(path) => info!("loaded config from {}", path.display()),
        ConfigSource::Defaults { skipped } => {
            for (path, e) in skipped {
                warn!("failed to load {}: {}", path.display(), e);
            }
            info!("no config file found, using defaults");
        }
    }

    match args.command {
        Some(Command::Scan) => run_scan(&config).await,
        Some(Command::Status) => run_status(&config).await,
        None => run_dashboard(&config).await,
    }
}

// ==============================================================================
// dashboard (default command)
// ==============================================================================

async fn run_dashboard(config: &ProbeConfig) -> Result<()> {
    info!("===========================================================");
    info!("  Probe Monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("  Tuya WT01/WT02 live temperature dashboard");
    info!("===========================================================");
    config.log_summary();

    // step 2: which probe
    let device = resolve_device(config)?;
    let profile = device.profile();
    info!("Device: {}", device.name.as_deref().unwrap_or("(from environment)"));
    info!("Device ID: {}", device.id);
    info!("Model: {}", profile.display_name);
    info!("Protocol version: {}", device.version);

    // step 3: bridge, locator, hub, session
    let (scanner, client) = build_bridge(config, &device.id);
    let settings = SessionSettings {
        interval: config.interval(),
        query_timeout: config.query_bound(),
        error_threshold: config.polling.error_threshold.max(1),
        show_readings: config.logging.show_readings,
    };
    let locator = DeviceLocator::new(&device.id, scanner, config.discovery.max_retries);
    let hub = LiveHub::new(config.polling.history_capacity);
    let session = Arc::new(ProbeSession::new(device, locator, client, hub, settings));

    // step 4: find the probe before the first tick
    info!("[STARTUP] Scanning for device...");
    match session.locator().locate().await {
        Some(address) => info!("[STARTUP] ✓ Device at {}", address),
        None => warn!("[STARTUP] Device not found on first scan, will retry each poll"),
    }

    // step 5: poll loop + web server until ctrl-c
    let shutdown = CancellationToken::new();
    let poller = session.spawn(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!("[STARTUP] ✓ Dashboard live at http://{}", config.server.bind);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", e);
            }
            info!("shutting down");
            shutdown.cancel();
        }
    });

    let served = server::serve(listener, session, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = poller.await {
        warn!("poll task ended abnormally: {}", e);
    }
    served
}

// ==============================================================================
// one-shot commands
// ==============================================================================

async fn run_scan(config: &ProbeConfig) -> Result<()> {
    // the real scanner ignores the id; the simulator answers with it
    let device_id = config::resolve_device(&DeviceEnv::from_env(), &config.registry.path)
        .map(|d| d.id)
        .unwrap_or_else(|_| SIMULATED_DEVICE_ID.to_string());
    let (scanner, _) = build_bridge(config, &device_id);

    println!("Scanning network for Tuya devices...");
    let entries = explore::scan_network(&*scanner, config.discovery.max_retries).await?;
    print!("{}", explore::render_scan(&entries));
    Ok(())
}

async fn run_status(config: &ProbeConfig) -> Result<()> {
    let device = resolve_device(config)?;
    let (scanner, client) = build_bridge(config, &device.id);
    let locator = DeviceLocator::new(&device.id, scanner, config.discovery.max_retries);

    println!("Scanning network for {}...", device.id);
    let dump = explore::read_status(&locator, &*client, &device, config.query_bound()).await?;
    print!("{}", explore::render_status(&device, &dump));
    Ok(())
}

// ==============================================================================
// shared setup
// ==============================================================================

fn resolve_device(config: &ProbeConfig) -> Result<DeviceDescriptor> {
    match config::resolve_device(&DeviceEnv::from_env(), &config.registry.path) {
        Ok(device) => Ok(device),
        Err(ConfigError::NoDevice) if config.bridge.mode == BridgeMode::Simulated => {
            Ok(simulated_device())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}

fn build_bridge(
    config: &ProbeConfig,
    device_id: &str,
) -> (Arc<dyn Scanner>, Arc<dyn StatusClient>) {
    match config.bridge.mode {
        BridgeMode::Tinytuya => {
            let bridge = Arc::new(TinytuyaBridge::new(
                &config.bridge.python,
                config.query_timeout(),
                config.scan_timeout(),
            ));
            (bridge.clone(), bridge)
        }
        BridgeMode::Simulated => {
            let probe = Arc::new(SimulatedProbe::new(device_id, Duration::from_secs(1)));
            (probe.clone(), probe)
        }
    }
}

/// RUST_LOG wins, then --verbose, then the configured level
fn init_logging(level: &str, verbose: bool) {
    let fallback = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn simulated_device() -> DeviceDescriptor {
    let model = ProbeModel::default();
    DeviceDescriptor {
        id: SIMULATED_DEVICE_ID.to_string(),
        local_key: String::new(),
        version: model.profile().default_version,
        model,
        name: Some("Simulated Probe".to_string()),
    }
}
