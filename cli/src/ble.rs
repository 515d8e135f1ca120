// btleplug-backed transport for the Nordic UART Service
//
// One adapter per scan, one connected peripheral at a time. Notifications on
// the TX characteristic are forwarded into the session channel by a spawned
// task; the link is polled to notice peers that walk away.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as AdapterScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{Stream, StreamExt};
use nuslog_core::signal::StopSignal;
use nuslog_core::transport::ble::{dedup_by_address, rank_by_signal};
use nuslog_core::transport::{
    describe_services, validate_nus_profile, Advertisement, DiscoveredDevice, ScanFilter, Session,
    Transport, TransportError, INBOUND_CHANNEL_CAPACITY, NUS_RX_CHAR_UUID, NUS_TX_CHAR_UUID,
    UNKNOWN_RSSI,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often a live link is checked for a silent disconnect
const LINK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Address some platforms (macOS) report instead of a real one
const NULL_ADDRESS: &str = "00:00:00:00:00:00";

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

struct Link {
    peripheral: Peripheral,
    rx: Characteristic,
    forwarder: JoinHandle<()>,
}

pub struct BtleTransport {
    manager: Manager,
    /// Peripherals from the most recent scans, keyed by reported address
    seen: Mutex<HashMap<String, Peripheral>>,
    link: Mutex<Option<Link>>,
    /// Peripheral a `connect` call is still setting up
    pending: Mutex<Option<Peripheral>>,
    scan_cancel: Notify,
}

/// Runs `cleanup` when dropped unless disarmed first.
///
/// The controller drops an in-flight `scan` or `connect` future when it is
/// stopped, so anything those calls started is released from here.
struct OnDrop<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> OnDrop<F> {
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Stop scanning from a synchronous context
fn spawn_stop_scan(adapter: Adapter) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("stop_scan after cancelled scan failed: {}", e);
            }
        });
    }
}

impl BtleTransport {
    pub async fn new() -> Result<Self, btleplug::Error> {
        Ok(Self {
            manager: Manager::new().await?,
            seen: Mutex::new(HashMap::new()),
            link: Mutex::new(None),
            pending: Mutex::new(None),
            scan_cancel: Notify::new(),
        })
    }

    async fn adapter(&self, hint: Option<&str>) -> Result<Adapter, TransportError> {
        let adapters = self.manager.adapters().await.map_err(scan_error)?;

        if let Some(hint) = hint {
            for adapter in &adapters {
                if let Ok(info) = adapter.adapter_info().await {
                    if adapter_matches(&info, hint) {
                        debug!("Using adapter {}", info);
                        return Ok(adapter.clone());
                    }
                }
            }
            warn!("No adapter matches '{}', using the first one", hint);
        }

        adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Scan("Bluetooth adapter not available".to_string()))
    }

    /// Describe a peripheral from its cached properties and remember it
    async fn observe(&self, peripheral: &Peripheral) -> Option<DiscoveredDevice> {
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            _ => return None,
        };

        let address = display_address(&props.address.to_string(), &peripheral.id().to_string());
        let device = DiscoveredDevice::new(
            address.clone(),
            props.local_name.unwrap_or_default(),
            props.rssi.map(i32::from).unwrap_or(UNKNOWN_RSSI),
        )
        .with_advertisement(Advertisement {
            service_uuids: props.services,
            manufacturer_data: props.manufacturer_data.into_iter().collect(),
        });

        self.seen.lock().insert(address, peripheral.clone());
        Some(device)
    }

    /// Discover the GATT table, check for NUS and subscribe to TX
    async fn open_nus(
        &self,
        peripheral: &Peripheral,
    ) -> Result<(Characteristic, Notifications), TransportError> {
        peripheral
            .discover_services()
            .await
            .map_err(connect_error)?;

        let mut table: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        for service in peripheral.services() {
            table.insert(
                service.uuid,
                service.characteristics.iter().map(|c| c.uuid).collect(),
            );
        }
        validate_nus_profile(&table).map_err(|e| TransportError::Connect(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::Connect(format!("characteristic {} missing", uuid)))
        };
        let tx = find(NUS_TX_CHAR_UUID)?;
        let rx = find(NUS_RX_CHAR_UUID)?;

        let notifications = peripheral.notifications().await.map_err(connect_error)?;
        peripheral.subscribe(&tx).await.map_err(connect_error)?;
        Ok((rx, notifications))
    }

    fn drop_link(&self) -> Option<Peripheral> {
        let link = self.link.lock().take()?;
        link.forwarder.abort();
        Some(link.peripheral)
    }

    fn connected_peripheral(&self) -> Option<Peripheral> {
        self.link.lock().as_ref().map(|l| l.peripheral.clone())
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let adapter = self.adapter(filter.adapter_hint.as_deref()).await?;
        let mut events = adapter.events().await.map_err(scan_error)?;

        let cancelled = self.scan_cancel.notified();
        tokio::pin!(cancelled);

        adapter
            .start_scan(AdapterScanFilter::default())
            .await
            .map_err(scan_error)?;
        let scanning = OnDrop::new({
            let adapter = adapter.clone();
            move || spawn_stop_scan(adapter)
        });
        debug!("Scanning for {:?} ({:?})", filter.name, filter.timeout);

        let deadline = Instant::now() + filter.timeout;
        loop {
            tokio::select! {
                _ = &mut cancelled => {
                    debug!("Scan cancelled");
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => break,
                event = events.next() => match event {
                    Some(
                        CentralEvent::DeviceDiscovered(id)
                        | CentralEvent::DeviceUpdated(id)
                        | CentralEvent::ServicesAdvertisement { id, .. },
                    ) => {
                        if filter.early_address_hint.is_none() {
                            continue;
                        }
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        if let Some(device) = self.observe(&peripheral).await {
                            if filter.accepts(&device) && filter.is_early_match(&device) {
                                debug!("Early match on {}", device);
                                break;
                            }
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        scanning.disarm();
        if let Err(e) = adapter.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }

        let mut found = Vec::new();
        for peripheral in adapter.peripherals().await.map_err(scan_error)? {
            if let Some(device) = self.observe(&peripheral).await {
                if filter.accepts(&device) {
                    found.push(device);
                }
            }
        }

        let mut found = dedup_by_address(found);
        rank_by_signal(&mut found);
        Ok(found)
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Session, TransportError> {
        let peripheral = self
            .seen
            .lock()
            .get(&device.address)
            .cloned()
            .ok_or_else(|| {
                TransportError::Connect(format!("{} was not seen by a scan", device.address))
            })?;

        *self.pending.lock() = Some(peripheral.clone());
        let opened = match peripheral.is_connected().await {
            Ok(true) => self.open_nus(&peripheral).await,
            _ => match peripheral.connect().await {
                Ok(()) => self.open_nus(&peripheral).await,
                Err(e) => Err(connect_error(e)),
            },
        };
        let (rx, mut notifications) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.pending.lock().take();
                if let Err(err) = peripheral.disconnect().await {
                    debug!("Disconnect after failed setup: {}", err);
                }
                return Err(e);
            }
        };

        let (tx, inbound) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != NUS_TX_CHAR_UUID {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            debug!("Notification stream closed");
        });

        self.pending.lock().take();
        let previous = self.link.lock().replace(Link {
            peripheral,
            rx,
            forwarder,
        });
        if let Some(previous) = previous {
            previous.forwarder.abort();
        }

        info!("NUS session open with {}", device);
        Ok(Session {
            device: device.clone(),
            inbound,
        })
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let (peripheral, rx) = self
            .link
            .lock()
            .as_ref()
            .map(|l| (l.peripheral.clone(), l.rx.clone()))
            .ok_or(TransportError::NotConnected)?;

        peripheral
            .write(&rx, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn run_until_disconnected(&self, mut stop: StopSignal) -> Result<(), TransportError> {
        let peripheral = self
            .connected_peripheral()
            .ok_or(TransportError::NotConnected)?;
        let mut poll = tokio::time::interval(LINK_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = stop.stopped() => return self.disconnect().await,
                _ = poll.tick() => match peripheral.is_connected().await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Link check failed: {}", e);
                        break;
                    }
                },
            }
        }

        info!("Peer disconnected");
        self.drop_link();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.scan_cancel.notify_waiters();

        let pending = self.pending.lock().take();
        if let Some(peripheral) = pending {
            debug!("Tearing down half-open connection");
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect of half-open peripheral failed: {}", e);
            }
        }
        if let Some(peripheral) = self.drop_link() {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect request failed: {}", e);
            }
        }
        Ok(())
    }

    async fn services_debug(&self) -> String {
        let Some(peripheral) = self.connected_peripheral() else {
            return "<not connected>".to_string();
        };

        let mut table = BTreeMap::new();
        for service in peripheral.services() {
            let characteristics = service
                .characteristics
                .iter()
                .map(|c| (c.uuid, format!("{:?}", c.properties)))
                .collect();
            table.insert(service.uuid, characteristics);
        }
        describe_services(&table)
    }
}

fn scan_error(e: btleplug::Error) -> TransportError {
    TransportError::Scan(e.to_string())
}

fn connect_error(e: btleplug::Error) -> TransportError {
    TransportError::Connect(e.to_string())
}

/// Case-insensitive match of an adapter hint (`hci1`) against adapter info
fn adapter_matches(info: &str, hint: &str) -> bool {
    info.to_lowercase().contains(&hint.trim().to_lowercase())
}

/// Prefer the hardware address, fall back to the platform id
fn display_address(address: &str, platform_id: &str) -> String {
    if address == NULL_ADDRESS {
        platform_id.to_string()
    } else {
        address.to_string()
    }
}
