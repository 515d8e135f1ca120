/// Nordic UART Service GATT profile
///
/// NUS exposes one service with two characteristics: RX, which the central
/// writes to, and TX, which the peripheral notifies on. Log output arrives on
/// TX. A device is only usable when all three are present.
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// NUS service UUID (Nordic 128-bit base)
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
/// RX characteristic (central → peripheral, write without response)
pub const NUS_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
/// TX characteristic (peripheral → central, notify)
pub const NUS_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Reasons a connected device cannot serve as a NUS endpoint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("NUS service {0} not found on device")]
    ServiceMissing(Uuid),
    #[error("NUS characteristic {0} missing")]
    CharacteristicMissing(Uuid),
}

/// Check a discovered GATT table for the NUS service and both characteristics.
///
/// `services` maps each service UUID to the characteristic UUIDs it contains.
pub fn validate_nus_profile(services: &BTreeMap<Uuid, Vec<Uuid>>) -> Result<(), GattError> {
    let characteristics = services
        .get(&NUS_SERVICE_UUID)
        .ok_or(GattError::ServiceMissing(NUS_SERVICE_UUID))?;

    for required in [NUS_TX_CHAR_UUID, NUS_RX_CHAR_UUID] {
        if !characteristics.contains(&required) {
            return Err(GattError::CharacteristicMissing(required));
        }
    }
    Ok(())
}

/// Render a GATT table the way `--verbose` prints it
pub fn describe_services(services: &BTreeMap<Uuid, Vec<(Uuid, String)>>) -> String {
    let mut lines = Vec::new();
    for (service, characteristics) in services {
        lines.push(format!("Service {}", service));
        for (uuid, properties) in characteristics {
            lines.push(format!("  Char {} [{}]", uuid, properties));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nus_table() -> BTreeMap<Uuid, Vec<Uuid>> {
        let mut table = BTreeMap::new();
        table.insert(NUS_SERVICE_UUID, vec![NUS_RX_CHAR_UUID, NUS_TX_CHAR_UUID]);
        table
    }

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            NUS_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            NUS_RX_CHAR_UUID.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            NUS_TX_CHAR_UUID.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_complete_profile_passes() {
        assert!(validate_nus_profile(&nus_table()).is_ok());
    }

    #[test]
    fn test_missing_service() {
        let mut table = BTreeMap::new();
        table.insert(Uuid::from_u128(0x180F), vec![Uuid::from_u128(0x2A19)]);
        assert_eq!(
            validate_nus_profile(&table),
            Err(GattError::ServiceMissing(NUS_SERVICE_UUID))
        );
    }

    #[test]
    fn test_missing_tx_characteristic() {
        let mut table = BTreeMap::new();
        table.insert(NUS_SERVICE_UUID, vec![NUS_RX_CHAR_UUID]);
        assert_eq!(
            validate_nus_profile(&table),
            Err(GattError::CharacteristicMissing(NUS_TX_CHAR_UUID))
        );
    }

    #[test]
    fn test_describe_services() {
        let mut table = BTreeMap::new();
        table.insert(
            NUS_SERVICE_UUID,
            vec![
                (NUS_RX_CHAR_UUID, "write-without-response,write".to_string()),
                (NUS_TX_CHAR_UUID, "notify".to_string()),
            ],
        );
        let text = describe_services(&table);
        assert!(text.starts_with("Service 6e400001"));
        assert!(text.contains("  Char 6e400003-b5a3-f393-e0a9-e50e24dcca9e [notify]"));
        assert_eq!(text.lines().count(), 3);
    }
}
