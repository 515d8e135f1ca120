//! Scriptable in-memory transport
//!
//! Stands in for a BLE stack in tests and demos: a fixed set of advertising
//! devices, a configurable number of scan / connect failures, and per-session
//! scripts describing what the peripheral sends and when it drops.

use super::abstraction::{
    DiscoveredDevice, ScanFilter, Session, Transport, TransportError, INBOUND_CHANNEL_CAPACITY,
};
use super::ble::scanner::rank_by_signal;
use crate::signal::StopSignal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// A transport operation, as observed by the simulation
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Scan(ScanFilter),
    Connect(String),
    Write(Vec<u8>),
    RunUntilDisconnected,
    Disconnect,
}

/// What one successful connection does
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    /// Payloads delivered right after connecting
    pub chunks: Vec<Vec<u8>>,
    /// Peer drops the link after this long; `None` keeps it up until stopped
    pub lifetime: Option<Duration>,
}

impl SessionScript {
    /// A session that sends `chunks` and then stays connected
    pub fn sending<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            lifetime: None,
        }
    }

    /// Drop the link after `lifetime`
    pub fn dropping_after(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }
}

struct LiveSession {
    address: String,
    tx: mpsc::Sender<Vec<u8>>,
    lifetime: Option<Duration>,
    gone: Arc<Notify>,
}

#[derive(Default)]
struct SimState {
    devices: Vec<DiscoveredDevice>,
    scan_delay: Duration,
    connect_delay: Duration,
    scan_failures: u32,
    connect_failures: u32,
    sessions: VecDeque<SessionScript>,
    live: Option<LiveSession>,
    calls: Vec<TransportCall>,
}

/// In-memory [`Transport`] driven by a script
#[derive(Default)]
pub struct SimulatedTransport {
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    /// A transport that sees no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that sees `devices` on every scan
    pub fn with_devices(devices: Vec<DiscoveredDevice>) -> Self {
        let transport = Self::new();
        transport.state.lock().devices = devices;
        transport
    }

    /// Replace the advertising devices (e.g. a device leaving range)
    pub fn set_devices(&self, devices: Vec<DiscoveredDevice>) {
        self.state.lock().devices = devices;
    }

    /// Make every scan take `delay` unless an early match is present
    pub fn set_scan_delay(&self, delay: Duration) {
        self.state.lock().scan_delay = delay;
    }

    /// Make every connect take `delay` before it succeeds or fails
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Fail the next `count` scans with an adapter error
    pub fn fail_scans(&self, count: u32) {
        self.state.lock().scan_failures = count;
    }

    /// Fail the next `count` connects as if the NUS service were missing
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    /// Queue the behaviour of the next successful connection
    pub fn push_session(&self, script: SessionScript) {
        self.state.lock().sessions.push_back(script);
    }

    /// Deliver bytes on the live session
    pub async fn inject(&self, data: &[u8]) -> Result<(), TransportError> {
        let tx = {
            let state = self.state.lock();
            state
                .live
                .as_ref()
                .map(|live| live.tx.clone())
                .ok_or(TransportError::NotConnected)?
        };
        tx.send(data.to_vec())
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Simulate the peer going away
    pub fn drop_connection(&self) {
        if let Some(live) = self.state.lock().live.take() {
            debug!("Simulated peer {} dropped the link", live.address);
            live.gone.notify_one();
        }
    }

    /// Whether a session is live
    pub fn is_connected(&self) -> bool {
        self.state.lock().live.is_some()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// Filters passed to `scan`, in order
    pub fn scan_filters(&self) -> Vec<ScanFilter> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Scan(filter) => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    /// Addresses passed to `connect`, in order
    pub fn connect_attempts(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Connect(address) => Some(address.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let (delay, early) = {
            let mut state = self.state.lock();
            state.calls.push(TransportCall::Scan(filter.clone()));
            let early = state.devices.iter().any(|d| filter.is_early_match(d));
            (state.scan_delay.min(filter.timeout), early)
        };

        if !early && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.scan_failures > 0 {
            state.scan_failures -= 1;
            return Err(TransportError::Scan("simulated adapter failure".to_string()));
        }

        let mut found: Vec<DiscoveredDevice> = state
            .devices
            .iter()
            .filter(|d| filter.accepts(d))
            .cloned()
            .collect();
        rank_by_signal(&mut found);
        Ok(found)
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Session, TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state
                .calls
                .push(TransportCall::Connect(device.address.clone()));
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::Connect(
                "NUS service UUID not found on device".to_string(),
            ));
        }

        let script = state.sessions.pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY.max(script.chunks.len()));
        for chunk in script.chunks {
            let _ = tx.try_send(chunk);
        }

        state.live = Some(LiveSession {
            address: device.address.clone(),
            tx,
            lifetime: script.lifetime,
            gone: Arc::new(Notify::new()),
        });

        Ok(Session {
            device: device.clone(),
            inbound: rx,
        })
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.live.is_none() {
            return Err(TransportError::NotConnected);
        }
        state.calls.push(TransportCall::Write(data.to_vec()));
        Ok(())
    }

    async fn run_until_disconnected(&self, mut stop: StopSignal) -> Result<(), TransportError> {
        let (gone, lifetime) = {
            let mut state = self.state.lock();
            state.calls.push(TransportCall::RunUntilDisconnected);
            let live = state.live.as_ref().ok_or(TransportError::NotConnected)?;
            (Arc::clone(&live.gone), live.lifetime)
        };

        let peer_drop = async {
            match lifetime {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = stop.stopped() => {
                self.disconnect().await?;
            }
            _ = gone.notified() => {}
            _ = peer_drop => {
                self.drop_connection();
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect);
        if let Some(live) = self.state.lock().live.take() {
            live.gone.notify_one();
        }
        Ok(())
    }
}
