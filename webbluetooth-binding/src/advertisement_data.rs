use std::collections::HashMap;

use uuid::Uuid;

use crate::handle::PeripheralHandle;

/// Data included in a Bluetooth advertisement or scan reponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The (possibly shortened) local name of the device (CSS §A.1.2)
    pub local_name: Option<String>,
    /// Manufacturer specific data (CSS §A.1.4)
    pub manufacturer_data: Vec<ManufacturerData>,
    /// Service associated data (CSS §A.1.11)
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub service_uuids: Vec<Uuid>,
    /// Transmitted power level (CSS §A.1.5)
    pub tx_power_level: Option<i16>,
    /// Set to true for connectable advertising packets
    pub is_connectable: bool,
}

/// Manufacturer specific data included in Bluetooth advertisements. See the Bluetooth Core Specification Supplement
/// §A.1.4 for details.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManufacturerData {
    /// Company identifier (defined [here](https://www.bluetooth.com/specifications/assigned-numbers/company-identifiers/))
    pub company_id: u16,
    /// Manufacturer specific data
    pub data: Vec<u8>,
}

impl ManufacturerData {
    /// Splits a raw AD structure payload into the little-endian company identifier and the
    /// remaining data.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        match raw {
            [lo, hi, data @ ..] => Some(ManufacturerData {
                company_id: u16::from_le_bytes([*lo, *hi]),
                data: data.to_vec(),
            }),
            _ => None,
        }
    }
}

impl AdvertisementData {
    pub fn manufacturer_data_for(&self, company_id: u16) -> Option<&[u8]> {
        self.manufacturer_data
            .iter()
            .find(|m| m.company_id == company_id)
            .map(|m| m.data.as_slice())
    }
}

/// A peripheral as reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub handle: PeripheralHandle,
    /// Stable device identifier: the address where the platform exposes it, otherwise a
    /// platform assigned UUID.
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertisement: AdvertisementData,
}

impl PeripheralInfo {
    /// The device name, falling back to the advertised local name.
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or(self.advertisement.local_name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manufacturer_data_splits_company_id() {
        let data = ManufacturerData::from_raw(&[0x4c, 0x00, 0x02, 0x15]).unwrap();
        assert_eq!(data.company_id, 0x004c);
        assert_eq!(data.data, vec![0x02, 0x15]);
        assert!(ManufacturerData::from_raw(&[0x4c]).is_none());
    }
}
