//! Caller-owned controller settings
//!
//! A fresh snapshot is taken at the start of every scan cycle, so edits made
//! while a run is active apply from the next cycle on. Durations serialize as
//! fractional seconds to keep config files readable.

use crate::error::LoggerError;
use crate::format::LineFormat;
use crate::retry::{BackoffConfig, JitterRange};
use crate::transport::ScanFilter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect and line-flush policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Go back to scanning after a lost session or failed attempt
    pub auto_reconnect: bool,
    /// Consecutive failed cycles tolerated before giving up
    pub max_retries: u64,
    #[serde(with = "secs_f64")]
    pub initial_backoff: Duration,
    #[serde(with = "secs_f64")]
    pub backoff_cap: Duration,
    /// A session at least this long resets the backoff
    #[serde(with = "secs_f64")]
    pub stable_period: Duration,
    /// How often the partial-line buffer is checked
    #[serde(with = "secs_f64")]
    pub idle_flush_interval: Duration,
    /// Silence after which a partial line is emitted
    #[serde(with = "secs_f64")]
    pub idle_threshold: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_retries: 1_000_000_000,
            initial_backoff: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(15),
            stable_period: Duration::from_secs(60),
            idle_flush_interval: Duration::from_millis(250),
            idle_threshold: Duration::from_millis(250),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff parameters with the standard jitter
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial: self.initial_backoff,
            cap: self.backoff_cap,
            jitter: JitterRange::default(),
        }
    }
}

/// What to connect to and how to render its output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Case-insensitive name substring; empty matches any device
    pub target_name: String,
    /// Address substring preferred over stronger candidates
    pub preferred_address: Option<String>,
    #[serde(with = "secs_f64")]
    pub scan_timeout: Duration,
    pub adapter_hint: Option<String>,
    /// Only consider devices advertising the NUS service
    pub require_service_advertised: bool,
    pub format: LineFormat,
    pub reconnect: ReconnectPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_name: String::new(),
            preferred_address: None,
            scan_timeout: Duration::from_secs(5),
            adapter_hint: None,
            require_service_advertised: true,
            format: LineFormat::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Settings {
    /// Settings targeting devices whose name contains `target_name`
    pub fn for_target(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), LoggerError> {
        if self.scan_timeout.is_zero() {
            return Err(LoggerError::InvalidSettings(
                "scan timeout must be positive".to_string(),
            ));
        }
        if self.reconnect.idle_flush_interval.is_zero() {
            return Err(LoggerError::InvalidSettings(
                "idle flush interval must be positive".to_string(),
            ));
        }
        self.reconnect.backoff_config().validate()?;
        Ok(())
    }

    /// Scan parameters for one cycle.
    ///
    /// `preferred` is both the candidate preference and the early-exit hint.
    pub fn scan_filter(&self, preferred: Option<String>) -> ScanFilter {
        ScanFilter {
            name: self.target_name.clone(),
            timeout: self.scan_timeout,
            adapter_hint: self.adapter_hint.clone(),
            early_address_hint: preferred,
            require_service: self.require_service_advertised,
        }
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.target_name.is_empty());
        assert_eq!(settings.scan_timeout, Duration::from_secs(5));
        assert!(settings.require_service_advertised);
        assert!(settings.reconnect.auto_reconnect);
        assert_eq!(settings.reconnect.max_retries, 1_000_000_000);
        assert_eq!(settings.reconnect.initial_backoff, Duration::from_millis(500));
        assert_eq!(settings.reconnect.backoff_cap, Duration::from_secs(15));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut settings = Settings::for_target("nrf");
        settings.reconnect.initial_backoff = Duration::from_secs(30);
        assert!(matches!(
            settings.validate(),
            Err(LoggerError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut settings = Settings::for_target("nrf");
        settings.scan_timeout = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_scan_filter_carries_hint() {
        let mut settings = Settings::for_target("logger");
        settings.adapter_hint = Some("hci1".to_string());
        settings.require_service_advertised = false;

        let filter = settings.scan_filter(Some("AA:BB".to_string()));
        assert_eq!(filter.name, "logger");
        assert_eq!(filter.adapter_hint.as_deref(), Some("hci1"));
        assert_eq!(filter.early_address_hint.as_deref(), Some("AA:BB"));
        assert!(!filter.require_service);
    }

    #[test]
    fn test_durations_serialize_as_seconds() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["scan_timeout"], 5.0);
        assert_eq!(json["reconnect"]["initial_backoff"], 0.5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"target_name":"nrf","reconnect":{"backoff_cap":4.0}}"#)
                .unwrap();
        assert_eq!(settings.target_name, "nrf");
        assert_eq!(settings.reconnect.backoff_cap, Duration::from_secs(4));
        assert_eq!(settings.reconnect.stable_period, Duration::from_secs(60));
        assert_eq!(settings.scan_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let result: Result<Settings, _> = serde_json::from_str(r#"{"scan_timeout":-1.0}"#);
        assert!(result.is_err());
    }
}
