// Interactive device picker
//
// Scans everything in range, lets the user pick a device by index and asks
// for the display options. The run that follows is pinned to the chosen
// address.

use crate::output::{Painter, Tone};
use anyhow::{Context, Result};
use nuslog_core::{ConnectionManager, DiscoveredDevice, ScanFilter, TimestampMode, Transport};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

/// What the user picked
#[derive(Debug, Clone, PartialEq)]
pub struct WizardChoice {
    pub device: DiscoveredDevice,
    pub timestamps: TimestampMode,
    pub raw_hex: bool,
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
enum Selection {
    Device(usize),
    Rescan,
    Quit,
    Invalid(String),
}

fn parse_selection(input: &str, count: usize) -> Selection {
    match input.trim().to_lowercase().as_str() {
        "q" => Selection::Quit,
        "" | "r" => Selection::Rescan,
        other => match other.parse::<usize>() {
            Ok(index) if index < count => Selection::Device(index),
            Ok(_) => Selection::Invalid("Invalid index.".to_string()),
            Err(_) => Selection::Invalid("Enter a numeric index, 'r', or 'q'.".to_string()),
        },
    }
}

fn parse_timestamps(input: &str) -> Option<TimestampMode> {
    match input.trim().to_lowercase().as_str() {
        "" | "n" => Some(TimestampMode::None),
        "u" => Some(TimestampMode::Utc),
        "l" => Some(TimestampMode::Local),
        _ => None,
    }
}

async fn prompt(text: &str) -> Result<String> {
    print!("{}", text);
    std::io::stdout().flush().context("Failed to flush stdout")?;

    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map(|_| line.trim().to_string())
    })
    .await
    .context("Prompt task failed")?
    .context("Failed to read from stdin")
}

/// Run the wizard. `Ok(None)` means the user backed out.
pub async fn run<T: Transport + 'static>(
    manager: &ConnectionManager<T>,
    painter: &dyn Painter,
    scan_timeout: Duration,
    adapter_hint: Option<String>,
) -> Result<Option<WizardChoice>> {
    if !std::io::stdin().is_terminal() {
        eprintln!("Wizard requested but stdin is not a TTY; aborting.");
        return Ok(None);
    }

    println!("{}", painter.paint(Tone::Ok, "nuslog wizard"));
    println!("Scanning for advertising devices (Ctrl-C to quit)...");

    let filter = ScanFilter {
        adapter_hint,
        require_service: false,
        ..ScanFilter::new("", scan_timeout)
    };

    let device = loop {
        let devices: Vec<DiscoveredDevice> = match manager.scan_with(&filter).await {
            Ok(devices) => devices
                .into_iter()
                .filter(|d| !d.name.trim().is_empty())
                .collect(),
            Err(e) => {
                eprintln!("{}", painter.paint(Tone::Err, &format!("Scan failed: {}", e)));
                if prompt("Retry scan? [Y/n]: ").await?.eq_ignore_ascii_case("n") {
                    return Ok(None);
                }
                continue;
            }
        };

        if devices.is_empty() {
            println!("No named devices found.");
            if prompt("(R)escan or (Q)uit? [R/q]: ")
                .await?
                .eq_ignore_ascii_case("q")
            {
                return Ok(None);
            }
            continue;
        }

        println!("\nDiscovered devices:");
        for (index, d) in devices.iter().enumerate() {
            println!("  [{}] {} | {} | RSSI {} dBm", index, d.name, d.address, d.rssi);
        }

        match parse_selection(
            &prompt("Select device index, or 'r' to rescan, 'q' to quit: ").await?,
            devices.len(),
        ) {
            Selection::Device(index) => break devices[index].clone(),
            Selection::Rescan => continue,
            Selection::Quit => return Ok(None),
            Selection::Invalid(message) => println!("{}", message),
        }
    };

    let timestamps = loop {
        match parse_timestamps(&prompt("Timestamp? (n)one, (u)tc, (l)ocal [n]: ").await?) {
            Some(mode) => break mode,
            None => println!("Please enter n, u, or l."),
        }
    };

    let raw_hex = prompt("Show raw hex column? (y/N): ")
        .await?
        .eq_ignore_ascii_case("y");

    let logfile = prompt("Logfile path (leave blank for none): ").await?;
    let logfile = (!logfile.is_empty()).then(|| PathBuf::from(logfile));

    println!(
        "{}",
        painter.paint(
            Tone::Ok,
            &format!("Selected {} ({})", device.name, device.address)
        )
    );

    Ok(Some(WizardChoice {
        device,
        timestamps,
        raw_hex,
        logfile,
    }))
}
