//! Transport abstraction layer for nuslog
//!
//! Defines the device, filter and session types exchanged with a wireless
//! stack, and the [`Transport`] trait the controller drives. Inbound bytes
//! travel over the session's channel rather than a callback.

use crate::signal::StopSignal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Depth of the inbound byte channel handed out with each session
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Advertisement data captured during a scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Service UUIDs listed in the advertisement or scan response
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer specific data keyed by company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl Advertisement {
    /// Whether `uuid` is advertised
    pub fn advertises(&self, uuid: &Uuid) -> bool {
        self.service_uuids.iter().any(|u| u == uuid)
    }
}

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Transport defined unique address
    pub address: String,
    /// Advertised local name, empty if none
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i32,
    /// Raw advertisement content
    pub advertisement: Advertisement,
}

impl DiscoveredDevice {
    /// Create a device without advertisement details
    pub fn new(address: impl Into<String>, name: impl Into<String>, rssi: i32) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            rssi,
            advertisement: Advertisement::default(),
        }
    }

    /// Attach advertisement details
    pub fn with_advertisement(mut self, advertisement: Advertisement) -> Self {
        self.advertisement = advertisement;
        self
    }

    /// Identity comparison across rescans (address, case-insensitive)
    pub fn same_device(&self, other: &DiscoveredDevice) -> bool {
        self.address.eq_ignore_ascii_case(&other.address)
    }
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.name.is_empty() {
            "<unnamed>"
        } else {
            &self.name
        };
        write!(f, "{} ({}) RSSI={}dBm", name, self.address, self.rssi)
    }
}

/// Parameters of one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Case-insensitive name substring, empty matches every device
    pub name: String,
    /// Scan window
    pub timeout: Duration,
    /// Platform specific adapter selector (e.g. `hci1` on Linux)
    pub adapter_hint: Option<String>,
    /// Stop scanning as soon as a device matching the name and this address
    /// substring is seen
    pub early_address_hint: Option<String>,
    /// Only accept devices advertising the Nordic UART Service
    pub require_service: bool,
}

impl ScanFilter {
    /// Scan for `name` for `timeout`, requiring the NUS advertisement
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            adapter_hint: None,
            early_address_hint: None,
            require_service: true,
        }
    }
}

/// A live connection handed back by [`Transport::connect`]
#[derive(Debug)]
pub struct Session {
    /// The device the session is connected to
    pub device: DiscoveredDevice,
    /// Raw notification payloads, in arrival order
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Scan failed: {0}")]
    Scan(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    Write(String),
}

/// Wireless connectivity the controller drives.
///
/// Implementations must tolerate `disconnect` at any time, including while a
/// scan is in flight (which it should cancel) and when nothing is connected.
/// A `scan` or `connect` future may be dropped midway; the controller then
/// calls `disconnect`, which must release whatever that call had acquired.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Collect devices matching `filter`, strongest signal first
    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Connect to `device` and start notifications.
    ///
    /// Must leave nothing connected when it fails.
    async fn connect(&self, device: &DiscoveredDevice) -> Result<Session, TransportError>;

    /// Write bytes to the peripheral's receive characteristic
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait until the peer goes away, or until `stop` fires (in which case
    /// the implementation requests the disconnect itself)
    async fn run_until_disconnected(&self, stop: StopSignal) -> Result<(), TransportError>;

    /// Tear down any session or scan. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Human readable listing of the connected device's services
    async fn services_debug(&self) -> String {
        "<not available>".to_string()
    }
}
