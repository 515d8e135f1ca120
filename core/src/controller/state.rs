// Controller state: lifecycle enum, status snapshot, run outcome

use super::settings::Settings;
use crate::error::LoggerError;
use crate::transport::{DiscoveredDevice, TransportError};
use serde::{Deserialize, Serialize};

/// What the controller is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Constructed, never started
    Idle,
    Scanning,
    Connecting,
    /// A session is live and lines are flowing
    Connected,
    /// The last session or attempt ended; deciding what comes next
    Disconnected,
    /// Waiting before the next scan
    Backoff,
    /// The run is over
    Stopped,
}

impl ConnectionState {
    /// Whether a scan or connect is in progress
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Backoff => write!(f, "backoff"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Identity of the connected peripheral as reported by status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub address: String,
    pub name: String,
    pub rssi: i32,
}

impl From<&DiscoveredDevice> for DeviceSummary {
    fn from(device: &DiscoveredDevice) -> Self {
        Self {
            address: device.address.clone(),
            name: device.name.clone(),
            rssi: device.rssi,
        }
    }
}

impl std::fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} ({})", self.name, self.address)
        }
    }
}

/// Point-in-time view of a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    /// The device of the live session
    pub device: Option<DeviceSummary>,
    /// Consecutive reconnect cycles since the last successful connect
    pub retry_count: u64,
    /// Address every later cycle reconnects to
    pub pinned_address: Option<String>,
    pub settings: Settings,
}

/// How a run started by `connect` ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionEnd {
    /// Stop was requested
    Stopped,
    /// The peer went away and reconnecting is disabled
    Disconnected,
    /// An attempt failed and reconnecting is disabled
    Failed { error: TransportError },
    /// Too many consecutive failed cycles
    RetryExhausted { attempts: u64 },
}

impl SessionEnd {
    /// Whether the run ended without an error
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Stopped | Self::Disconnected)
    }

    pub fn into_result(self) -> Result<(), LoggerError> {
        match self {
            Self::Stopped | Self::Disconnected => Ok(()),
            Self::Failed { error } => Err(LoggerError::Transport(error)),
            Self::RetryExhausted { attempts } => Err(LoggerError::RetryExhausted { attempts }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connecting_states() {
        assert!(ConnectionState::Scanning.is_connecting());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(!ConnectionState::Connected.is_connecting());
        assert!(!ConnectionState::Backoff.is_connecting());
        assert!(!ConnectionState::Stopped.is_connecting());
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"connected\""
        );
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[test]
    fn test_device_summary() {
        let device = DiscoveredDevice::new("AA:BB", "logger", -61);
        let summary = DeviceSummary::from(&device);
        assert_eq!(summary.rssi, -61);
        assert_eq!(summary.to_string(), "logger (AA:BB)");

        let unnamed = DeviceSummary::from(&DiscoveredDevice::new("CC:DD", "", -70));
        assert_eq!(unnamed.to_string(), "CC:DD");
    }

    #[test]
    fn test_session_end_results() {
        assert!(SessionEnd::Stopped.into_result().is_ok());
        assert!(SessionEnd::Disconnected.is_clean());

        let failed = SessionEnd::Failed {
            error: TransportError::Connect("gone".into()),
        };
        assert!(!failed.is_clean());
        assert!(matches!(
            failed.into_result(),
            Err(LoggerError::Transport(TransportError::Connect(_)))
        ));

        assert!(matches!(
            SessionEnd::RetryExhausted { attempts: 4 }.into_result(),
            Err(LoggerError::RetryExhausted { attempts: 4 })
        ));
    }

    #[test]
    fn test_session_end_json() {
        let json = serde_json::to_string(&SessionEnd::RetryExhausted { attempts: 2 }).unwrap();
        assert_eq!(json, r#"{"outcome":"retry_exhausted","attempts":2}"#);
    }
}
