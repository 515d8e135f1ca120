/// BLE (Bluetooth Low Energy) specifics of the Nordic UART Service
///
/// - **gatt**: NUS service / characteristic identifiers and profile validation
/// - **scanner**: scan result filtering and connect-candidate selection
///
/// Platform BLE stacks plug in through [`crate::transport::Transport`]; the
/// logic here is testable without hardware.

pub mod gatt;
pub mod scanner;

pub use gatt::{
    describe_services, validate_nus_profile, GattError, NUS_RX_CHAR_UUID, NUS_SERVICE_UUID,
    NUS_TX_CHAR_UUID,
};

pub use scanner::{
    address_matches, dedup_by_address, name_matches, rank_by_signal, select_candidate,
    UNKNOWN_RSSI,
};
