// Terminal rendering of controller events
//
// Decoded log lines are printed untouched; only the logger's own notices get
// color, and only when a colored painter was chosen at startup.

use colored::*;
use nuslog_core::{ControllerEvent, SessionEnd};

/// Severity of a notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Ok,
    Warn,
    Err,
    Info,
}

pub trait Painter: Send + Sync {
    fn paint(&self, tone: Tone, text: &str) -> String;
}

/// Leaves text as is
pub struct Plain;

impl Painter for Plain {
    fn paint(&self, _tone: Tone, text: &str) -> String {
        text.to_string()
    }
}

pub struct Colored;

impl Painter for Colored {
    fn paint(&self, tone: Tone, text: &str) -> String {
        match tone {
            Tone::Ok => text.green().to_string(),
            Tone::Warn => text.yellow().to_string(),
            Tone::Err => text.red().to_string(),
            Tone::Info => text.dimmed().to_string(),
        }
    }
}

pub fn painter(color: bool) -> Box<dyn Painter> {
    if color {
        Box::new(Colored)
    } else {
        Box::new(Plain)
    }
}

/// A rendered notice and whether it belongs on stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub tone: Tone,
    pub text: String,
    pub to_stderr: bool,
}

impl Notice {
    fn out(tone: Tone, text: String) -> Self {
        Self {
            tone,
            text,
            to_stderr: false,
        }
    }

    fn err(text: String) -> Self {
        Self {
            tone: Tone::Err,
            text,
            to_stderr: true,
        }
    }
}

/// Notices for one event. State transitions only go to the trace log.
pub fn describe(event: &ControllerEvent, verbose: bool) -> Vec<Notice> {
    match event {
        ControllerEvent::Scanning {
            target,
            pinned_address,
        } if verbose => {
            let text = match pinned_address {
                Some(address) => format!("Scanning for '{}' (prefer {})...", target, address),
                None => format!("Scanning for '{}'...", target),
            };
            vec![Notice::out(Tone::Info, text)]
        }
        ControllerEvent::Connected { device } => {
            vec![Notice::out(
                Tone::Ok,
                format!("Connected to {} RSSI={}dBm", device, device.rssi),
            )]
        }
        ControllerEvent::Disconnected { .. } => {
            vec![Notice::out(Tone::Warn, "Disconnected".to_string())]
        }
        ControllerEvent::AttemptFailed { error } => {
            let message = error.to_string();
            let mut notices = vec![Notice::err(format!("BLE error: {}", message))];
            notices.extend(hints(&message).into_iter().map(|hint| Notice {
                tone: Tone::Info,
                text: hint.to_string(),
                to_stderr: true,
            }));
            notices
        }
        ControllerEvent::Reconnecting { delay, .. } => vec![Notice::out(
            Tone::Warn,
            format!("Reconnecting in {:.2}s...", delay.as_secs_f64()),
        )],
        ControllerEvent::RetryExhausted { .. } => {
            vec![Notice::out(Tone::Err, "Max retries reached, exiting.".to_string())]
        }
        ControllerEvent::Finished {
            outcome: SessionEnd::Failed { error },
        } => vec![Notice::err(format!("Stopped after error: {}", error))],
        _ => Vec::new(),
    }
}

/// Remedies for well-known platform failures
pub fn hints(message: &str) -> Vec<&'static str> {
    let message = message.to_lowercase();
    let mut hints = Vec::new();
    if message.contains("not available")
        || message.contains("management command")
        || message.contains("powered")
    {
        hints.push("Hint: Ensure the Bluetooth adapter is powered and not blocked (rfkill).");
    }
    if message.contains("permission") && cfg!(target_os = "linux") {
        hints.push(
            "Hint: Missing permissions. Add your user to the 'bluetooth' group or grant cap_net_raw.",
        );
    }
    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuslog_core::{DeviceSummary, TransportError};
    use std::time::Duration;

    #[test]
    fn test_plain_painter_is_identity() {
        assert_eq!(Plain.paint(Tone::Err, "boom"), "boom");
    }

    #[test]
    fn test_colored_painter_keeps_text() {
        colored::control::set_override(true);
        let painted = Colored.paint(Tone::Ok, "ready");
        assert!(painted.contains("ready"));
        assert_ne!(painted, "ready");
    }

    #[test]
    fn test_connected_notice() {
        let event = ControllerEvent::Connected {
            device: DeviceSummary {
                address: "C0:01".to_string(),
                name: "logger".to_string(),
                rssi: -52,
            },
        };
        let notices = describe(&event, false);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].tone, Tone::Ok);
        assert!(notices[0].text.starts_with("Connected to "));
        assert!(notices[0].text.ends_with("(C0:01) RSSI=-52dBm"));
    }

    #[test]
    fn test_reconnect_delay_rendering() {
        let event = ControllerEvent::Reconnecting {
            attempt: 2,
            delay: Duration::from_millis(1250),
        };
        assert_eq!(describe(&event, false)[0].text, "Reconnecting in 1.25s...");
    }

    #[test]
    fn test_scanning_only_when_verbose() {
        let event = ControllerEvent::Scanning {
            target: "nrf".to_string(),
            pinned_address: None,
        };
        assert!(describe(&event, false).is_empty());
        assert_eq!(describe(&event, true)[0].text, "Scanning for 'nrf'...");
    }

    #[test]
    fn test_adapter_hint_attached_to_failure() {
        let event = ControllerEvent::AttemptFailed {
            error: TransportError::Scan("Bluetooth adapter not available".to_string()),
        };
        let notices = describe(&event, false);
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|n| n.to_stderr));
        assert!(notices[1].text.contains("rfkill"));
    }

    #[test]
    fn test_no_hint_for_unrelated_errors() {
        assert!(hints("no device matching 'nrf' found").is_empty());
    }
}
