/// Scan result filtering and candidate selection
///
/// Transports report every advertiser they hear; these helpers decide which
/// of them match the configured name, whether a preferred address is among
/// them, and which one to connect to (strongest signal wins).
use super::gatt::NUS_SERVICE_UUID;
use crate::transport::abstraction::{DiscoveredDevice, ScanFilter};

/// RSSI reported for devices whose signal strength is unknown
pub const UNKNOWN_RSSI: i32 = -200;

/// Case-insensitive substring match on the advertised name.
///
/// An empty filter matches every device, including unnamed ones. A non-empty
/// filter never matches an unnamed device.
pub fn name_matches(filter: &str, name: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let name = name.trim();
    !name.is_empty() && name.to_lowercase().contains(&filter.to_lowercase())
}

/// Case-insensitive substring match on the device address
pub fn address_matches(hint: &str, address: &str) -> bool {
    address.to_lowercase().contains(&hint.to_lowercase())
}

impl ScanFilter {
    /// Whether `device` belongs in this scan's results
    pub fn accepts(&self, device: &DiscoveredDevice) -> bool {
        if !name_matches(&self.name, &device.name) {
            return false;
        }
        !self.require_service || device.advertisement.advertises(&NUS_SERVICE_UUID)
    }

    /// Whether seeing `device` allows the scan to end before its timeout
    pub fn is_early_match(&self, device: &DiscoveredDevice) -> bool {
        match &self.early_address_hint {
            Some(hint) => {
                name_matches(&self.name, &device.name) && address_matches(hint, &device.address)
            }
            None => false,
        }
    }
}

/// Order devices strongest signal first (stable for equal RSSI)
pub fn rank_by_signal(devices: &mut [DiscoveredDevice]) {
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
}

/// Drop repeated sightings of the same address, keeping the first
pub fn dedup_by_address(devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    let mut unique: Vec<DiscoveredDevice> = Vec::with_capacity(devices.len());
    for device in devices {
        if !unique.iter().any(|d| d.same_device(&device)) {
            unique.push(device);
        }
    }
    unique
}

/// Pick the device to connect to.
///
/// When `preferred` matches at least one candidate the choice is narrowed to
/// those; otherwise every candidate stays eligible. The strongest remaining
/// signal wins.
pub fn select_candidate(
    mut candidates: Vec<DiscoveredDevice>,
    preferred: Option<&str>,
) -> Option<DiscoveredDevice> {
    if let Some(hint) = preferred {
        if candidates.iter().any(|c| address_matches(hint, &c.address)) {
            candidates.retain(|c| address_matches(hint, &c.address));
        }
    }
    rank_by_signal(&mut candidates);
    candidates.into_iter().next()
}
