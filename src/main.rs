//! # TSW Controller
//!
//! Drive a train simulator from a joystick.
//!
//! The binary reads joysticks through evdev, presses keys on a uinput
//! virtual keyboard and talks to the simulator bridge with line-based
//! messages on stdin/stdout. Logs go to stderr and, optionally, a daily
//! rolling file.
//!
//! # Usage
//!
//! ```bash
//! tsw-controller [config.toml]
//! ```

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use tsw_controller::config::{FilesConfig, LoggingConfig, ProgramConfig};
use tsw_controller::controller::calibration::ControllerCalibration;
use tsw_controller::controller::evdev_source::EvdevJoystick;
use tsw_controller::controller::sdl_mapping::SdlMapping;
use tsw_controller::engine::Engine;
use tsw_controller::profile::model::Profile;
use tsw_controller::remote_api::TransportRemoteApi;
use tsw_controller::sequencer::keyboard::UinputKeyboard;
use tsw_controller::transport::{write_lines, LocalTransport};

/// Config file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Capacity of the device notification queue
const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

/// Install the stderr logger and, with `log_dir` set, the file logger.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry.with(fmt::layer().with_ansi(false).with_writer(writer)).init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn load_config() -> Result<ProgramConfig> {
    match std::env::args().nth(1) {
        Some(path) => ProgramConfig::load(&path).with_context(|| format!("Failed to load config {}", path)),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            ProgramConfig::load(DEFAULT_CONFIG_PATH).context("Failed to load config.toml")
        }
        None => Ok(ProgramConfig::default()),
    }
}

/// Register every calibration with the mapping of the same usb id, then
/// every profile. Broken documents are logged and skipped.
async fn load_documents(engine: &Engine, files: &FilesConfig) {
    let mut mappings = Vec::new();
    for path in &files.sdl_mappings {
        match SdlMapping::load(path) {
            Ok(mapping) => mappings.push(mapping),
            Err(e) => warn!("Skipping mapping {}: {}", path.display(), e),
        }
    }

    for path in &files.calibrations {
        let calibration = match ControllerCalibration::load(path) {
            Ok(calibration) => calibration,
            Err(e) => {
                warn!("Skipping calibration {}: {}", path.display(), e);
                continue;
            }
        };
        let Some(mapping) = mappings.iter().find(|m| m.usb_id == calibration.usb_id) else {
            warn!("No mapping for calibration {} ({})", path.display(), calibration.usb_id);
            continue;
        };
        if let Err(e) = engine.register_calibration(mapping.clone(), calibration).await {
            warn!("Skipping calibration {}: {}", path.display(), e);
        }
    }

    for path in &files.profiles {
        match Profile::load(path) {
            Ok(profile) => {
                let name = profile.name.clone();
                let id = engine.register_profile(profile).await;
                info!("Loaded profile '{}' ({})", name, id);
            }
            Err(e) => warn!("Skipping profile {}: {}", path.display(), e),
        }
    }
}

/// Main entry point for TSW Controller
///
/// # Control Flow
///
/// 1. Load configuration and set up logging
/// 2. Create the virtual keyboard and the stdin/stdout transport
/// 3. Start the engine, load mappings, calibrations and profiles
/// 4. Open joysticks and feed their events to the engine
/// 5. Run until Ctrl+C, then cancel every task and release held keys
///
/// # Errors
///
/// Returns error if the configuration is invalid or the virtual keyboard
/// cannot be created.
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config.logging);

    info!("TSW Controller v{} starting...", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();

    let keyboard = UinputKeyboard::create(&config.sequencer.keyboard_name)
        .context("Failed to create virtual keyboard (is /dev/uinput writable?)")?;

    let fanout_timeout = Duration::from_millis(config.engine.fanout_timeout_ms);
    let (transport, outgoing) = LocalTransport::new(config.engine.event_queue_capacity, fanout_timeout);
    let transport = Arc::new(transport);

    let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
    let engine = Engine::start(
        &config,
        notify_rx,
        keyboard,
        transport.clone(),
        Arc::new(TransportRemoteApi::new(transport.clone())),
        cancel.clone(),
    );
    load_documents(&engine, &config.files).await;

    let writer = tokio::spawn(write_lines(outgoing, tokio::io::stdout(), cancel.clone()));
    let reader = {
        let transport = transport.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { transport.read_lines(BufReader::new(tokio::io::stdin()), cancel).await })
    };

    match EvdevJoystick::discover(&config.controller.device_paths) {
        Ok(joysticks) => {
            for joystick in joysticks {
                let path = joystick.device_path();
                match joystick.spawn_reader(notify_tx.clone(), cancel.clone()) {
                    Ok(_) => info!("Reading joystick at {}", path),
                    Err(e) => error!("Failed to read joystick at {}: {}", path, e),
                }
            }
        }
        Err(e) => warn!("{}", e),
    }
    drop(notify_tx);

    info!("Press Ctrl+C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down...");

    engine.shutdown().await;
    for (name, task) in [("writer", writer), ("reader", reader)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Transport {} failed: {}", name, e),
            Err(e) => warn!("Transport {} task ended abnormally: {}", name, e),
        }
    }

    Ok(())
}
