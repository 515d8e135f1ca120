// Transport module: wireless stack seam, NUS profile helpers, simulation

pub mod abstraction;
pub mod ble;
pub mod simulated;

pub use abstraction::{
    Advertisement, DiscoveredDevice, ScanFilter, Session, Transport, TransportError,
    INBOUND_CHANNEL_CAPACITY,
};
#[cfg(test)]
pub use abstraction::MockTransport;
pub use ble::{
    describe_services, select_candidate, validate_nus_profile, GattError, NUS_RX_CHAR_UUID,
    NUS_SERVICE_UUID, NUS_TX_CHAR_UUID, UNKNOWN_RSSI,
};
pub use simulated::{SessionScript, SimulatedTransport, TransportCall};
