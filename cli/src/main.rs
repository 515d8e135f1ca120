// nuslog: terminal logger for BLE Nordic UART peripherals
//
// Finds a device by name, prints every line it sends over NUS and keeps
// reconnecting with backoff when the link drops. Runs on macOS, Linux and
// Windows through btleplug.

mod ble;
mod config;
mod output;
mod wizard;

use anyhow::{Context, Result};
use ble::BtleTransport;
use clap::Parser;
use config::Config;
use nuslog_core::transport::ble::dedup_by_address;
use nuslog_core::{
    ConnectionManager, ControllerEvent, DiscoveredDevice, FileSink, ScanFilter, SessionEnd,
    Settings, TimestampMode,
};
use output::{Painter, Tone};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nuslog")]
#[command(about = "Stream log lines from a BLE Nordic UART Service peripheral", long_about = None)]
#[command(version)]
struct Cli {
    /// Device name substring to connect to (case-insensitive)
    #[arg(short, long, env = "NUS_NAME", required_unless_present_any = ["list", "wizard"])]
    name: Option<String>,

    /// Scan timeout in seconds [default: 5.0]
    #[arg(short, long, env = "NUS_TIMEOUT")]
    timeout: Option<f64>,

    /// Adapter hint (Linux: hciX). Ignored on Windows/macOS.
    #[arg(long, env = "NUS_ADAPTER")]
    adapter: Option<String>,

    /// Append decoded lines to this file
    #[arg(long, env = "NUS_LOGFILE")]
    logfile: Option<PathBuf>,

    /// Append the raw bytes of each line as hex
    #[arg(long)]
    raw: bool,

    /// Prefix lines with a UTC timestamp
    #[arg(long, conflicts_with = "ts_local")]
    ts: bool,

    /// Prefix lines with a local-time timestamp
    #[arg(long)]
    ts_local: bool,

    /// Exit when the link drops instead of reconnecting
    #[arg(long)]
    no_reconnect: bool,

    /// Consecutive failed reconnect cycles before giving up
    #[arg(long, env = "NUS_MAX_RETRIES")]
    max_retries: Option<u64>,

    /// Initial reconnect backoff in seconds [default: 0.5]
    #[arg(long, env = "NUS_BACKOFF")]
    backoff: Option<f64>,

    /// Debug logging, and print the GATT table on connect
    #[arg(short, long)]
    verbose: bool,

    /// List advertising devices and exit
    #[arg(long)]
    list: bool,

    /// Prefer devices whose address contains this substring
    #[arg(long)]
    filter_addr: Option<String>,

    /// Choose the device and display options interactively
    #[arg(long)]
    wizard: bool,

    /// Accept devices that do not advertise the NUS service
    #[arg(long)]
    any_service: bool,

    /// Never color connection notices
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // No arguments at all starts the wizard
    let cli = if std::env::args_os().len() <= 1 {
        Cli::parse_from(["nuslog", "--wizard"])
    } else {
        Cli::parse()
    };

    // Decoded lines own stdout; diagnostics go to stderr
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(writer)
        .init();

    let config = Config::load().context("Failed to load config")?;
    let painter: Arc<dyn Painter> = Arc::from(output::painter(
        config.color && !cli.no_color && std::io::stdout().is_terminal(),
    ));
    let mut settings = apply_flags(&cli, config.settings.clone())?;

    let transport = match BtleTransport::new().await {
        Ok(transport) => transport,
        Err(e) => {
            report_failure(&*painter, &format!("Bluetooth unavailable: {}", e));
            return Ok(ExitCode::from(2));
        }
    };
    let manager = Arc::new(ConnectionManager::new(transport));

    if cli.list {
        return list_devices(&manager, &settings, &*painter).await;
    }

    let mut logfile = cli.logfile.clone().or_else(|| config.logfile.clone());

    if cli.wizard {
        let choice = wizard::run(
            manager.as_ref(),
            &*painter,
            settings.scan_timeout,
            settings.adapter_hint.clone(),
        )
        .await?;
        let Some(choice) = choice else {
            return Ok(ExitCode::SUCCESS);
        };

        settings.target_name = choice.device.name.clone();
        settings.preferred_address = Some(choice.device.address.clone());
        // the pick came from an unfiltered scan
        settings.require_service_advertised = false;
        settings.format.timestamps = choice.timestamps;
        settings.format.raw_hex = choice.raw_hex;
        settings.reconnect.auto_reconnect = true;
        logfile = choice.logfile;
    }

    run_logger(manager, settings, logfile, cli.verbose, painter).await
}

/// Layer command-line flags (and their env vars) over the stored defaults
fn apply_flags(cli: &Cli, mut settings: Settings) -> Result<Settings> {
    if let Some(name) = &cli.name {
        settings.target_name = name.clone();
    }
    if let Some(timeout) = cli.timeout {
        settings.scan_timeout = seconds(timeout, "--timeout")?;
    }
    if let Some(adapter) = &cli.adapter {
        settings.adapter_hint = Some(adapter.clone());
    }
    if let Some(address) = &cli.filter_addr {
        settings.preferred_address = Some(address.clone());
    }
    if cli.raw {
        settings.format.raw_hex = true;
    }
    if cli.ts {
        settings.format.timestamps = TimestampMode::Utc;
    } else if cli.ts_local {
        settings.format.timestamps = TimestampMode::Local;
    }
    if cli.no_reconnect {
        settings.reconnect.auto_reconnect = false;
    }
    if let Some(max_retries) = cli.max_retries {
        settings.reconnect.max_retries = max_retries;
    }
    if let Some(backoff) = cli.backoff {
        settings.reconnect.initial_backoff = seconds(backoff, "--backoff")?;
    }
    if cli.any_service {
        settings.require_service_advertised = false;
    }

    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid {} value: {}", flag, value))
}

async fn run_logger(
    manager: Arc<ConnectionManager<BtleTransport>>,
    settings: Settings,
    logfile: Option<PathBuf>,
    verbose: bool,
    painter: Arc<dyn Painter>,
) -> Result<ExitCode> {
    if let Some(path) = &logfile {
        let sink = FileSink::open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        manager.set_sink(Some(Box::new(sink)));
        println!(
            "{}",
            painter.paint(Tone::Ok, &format!("Logging to {}", path.display()))
        );
    }

    let mut lines = manager.subscribe();
    let subscriber = lines.id();
    let printer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            let mut stdout = std::io::stdout().lock();
            if writeln!(stdout, "{}", line).is_err() {
                break;
            }
        }
    });

    let notifier = tokio::spawn(render_events(
        manager.events(),
        manager.clone(),
        verbose,
        painter.clone(),
    ));

    manager
        .connect(settings)
        .await
        .context("Failed to start the connection controller")?;

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            println!("{}", painter.paint(Tone::Warn, "Received Ctrl-C, shutting down..."));
            manager.disconnect().await?
        }
        outcome = manager.wait() => outcome.unwrap_or(SessionEnd::Stopped),
    };

    manager.set_sink(None);
    manager.broadcaster().unsubscribe_id(subscriber);
    if let Err(e) = printer.await {
        debug!("Line printer ended abnormally: {}", e);
    }
    if let Err(e) = notifier.await {
        debug!("Event renderer ended abnormally: {}", e);
    }

    Ok(match outcome {
        SessionEnd::Stopped | SessionEnd::Disconnected => ExitCode::SUCCESS,
        SessionEnd::Failed { .. } | SessionEnd::RetryExhausted { .. } => ExitCode::FAILURE,
    })
}

async fn render_events(
    mut events: broadcast::Receiver<ControllerEvent>,
    manager: Arc<ConnectionManager<BtleTransport>>,
    verbose: bool,
    painter: Arc<dyn Painter>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                debug!("Skipped {} controller events", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        debug!("Controller event: {:?}", event);

        for notice in output::describe(&event, verbose) {
            let text = painter.paint(notice.tone, &notice.text);
            if notice.to_stderr {
                eprintln!("{}", text);
            } else {
                println!("{}", text);
            }
        }

        match event {
            ControllerEvent::Connected { .. } if verbose => {
                println!("Services:\n{}", manager.services_debug().await);
            }
            ControllerEvent::Finished { .. } => break,
            _ => {}
        }
    }
}

async fn list_devices(
    manager: &ConnectionManager<BtleTransport>,
    settings: &Settings,
    painter: &dyn Painter,
) -> Result<ExitCode> {
    let filter = ScanFilter {
        adapter_hint: settings.adapter_hint.clone(),
        require_service: false,
        ..ScanFilter::new("", settings.scan_timeout)
    };

    let devices = match manager.scan_with(&filter).await {
        Ok(devices) => devices,
        Err(e) => {
            report_failure(painter, &format!("Scan failed: {}", e));
            return Ok(ExitCode::from(2));
        }
    };

    let named: Vec<DiscoveredDevice> = dedup_by_address(devices)
        .into_iter()
        .filter(|d| !d.name.trim().is_empty())
        .collect();
    if named.is_empty() {
        println!("No devices with names discovered.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Discovered devices (name | address | RSSI dBm):");
    for device in &named {
        println!("{}", list_row(device));
    }
    Ok(ExitCode::SUCCESS)
}

fn list_row(device: &DiscoveredDevice) -> String {
    format!("{} | {} | {}", device.name, device.address, device.rssi)
}

fn report_failure(painter: &dyn Painter, message: &str) {
    eprintln!("{}", painter.paint(Tone::Err, message));
    for hint in output::hints(message) {
        eprintln!("{}", hint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("nuslog").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_name_required_without_list_or_wizard() {
        assert!(Cli::try_parse_from(["nuslog", "--raw"]).is_err());
        assert!(Cli::try_parse_from(["nuslog", "--list"]).is_ok());
        assert!(Cli::try_parse_from(["nuslog", "--wizard"]).is_ok());
    }

    #[test]
    fn test_timestamp_flags_conflict() {
        assert!(Cli::try_parse_from(["nuslog", "-n", "nrf", "--ts", "--ts-local"]).is_err());
    }

    #[test]
    fn test_flags_override_stored_defaults() {
        let cli = parse(&[
            "--name",
            "nrf",
            "--timeout",
            "2.5",
            "--ts-local",
            "--raw",
            "--no-reconnect",
            "--max-retries",
            "7",
            "--backoff",
            "1.0",
            "--filter-addr",
            "C0:FF",
            "--any-service",
        ]);
        let settings = apply_flags(&cli, Settings::default()).unwrap();

        assert_eq!(settings.target_name, "nrf");
        assert_eq!(settings.scan_timeout, Duration::from_millis(2500));
        assert_eq!(settings.format.timestamps, TimestampMode::Local);
        assert!(settings.format.raw_hex);
        assert!(!settings.reconnect.auto_reconnect);
        assert_eq!(settings.reconnect.max_retries, 7);
        assert_eq!(settings.reconnect.initial_backoff, Duration::from_secs(1));
        assert_eq!(settings.preferred_address.as_deref(), Some("C0:FF"));
        assert!(!settings.require_service_advertised);
    }

    #[test]
    fn test_unset_flags_keep_stored_defaults() {
        let mut stored = Settings::default();
        stored.scan_timeout = Duration::from_secs(9);
        stored.format.raw_hex = true;

        let settings = apply_flags(&parse(&["-n", "nrf"]), stored).unwrap();
        assert_eq!(settings.scan_timeout, Duration::from_secs(9));
        assert!(settings.format.raw_hex);
        assert!(settings.reconnect.auto_reconnect);
    }

    #[test]
    fn test_bad_durations_rejected() {
        assert!(apply_flags(&parse(&["-n", "nrf", "--timeout=-1"]), Settings::default()).is_err());
        assert!(apply_flags(&parse(&["-n", "nrf", "--timeout", "0"]), Settings::default()).is_err());
        // backoff above the 15s cap
        assert!(apply_flags(&parse(&["-n", "nrf", "--backoff", "20"]), Settings::default()).is_err());
    }

    #[test]
    fn test_list_row_format() {
        let device = DiscoveredDevice::new("C0:FF:EE:00:00:01", "logger", -61);
        assert_eq!(list_row(&device), "logger | C0:FF:EE:00:00:01 | -61");
    }
}
