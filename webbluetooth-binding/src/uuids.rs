//! Conversion of Bluetooth short-form UUIDs to canonical 128-bit UUIDs.
//!
//! Every UUID that crosses the native boundary is a full 128-bit [`Uuid`]. 16- and 32-bit
//! aliases are expanded over the Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`
//! (Core Specification Vol 3, Part B, §2.5.1).

use btuuid::BluetoothUuid;
use uuid::Uuid;

/// The Bluetooth base UUID.
pub const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

const BASE_MASK: u128 = (1 << 96) - 1;

pub const fn from_u16(alias: u16) -> Uuid {
    from_u32(alias as u32)
}

pub const fn from_u32(alias: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((alias as u128) << 96))
}

/// Expands any Bluetooth UUID to its canonical 128-bit form.
pub fn canonical(uuid: BluetoothUuid) -> Uuid {
    match uuid {
        BluetoothUuid::Uuid16(alias) => from_u16(alias.into()),
        BluetoothUuid::Uuid32(alias) => from_u32(alias.into()),
        BluetoothUuid::Uuid128(value) => Uuid::from_u128(value.into()),
    }
}

/// Returns the 32-bit alias of `uuid` if it lies on the Bluetooth base UUID.
pub fn short_form(uuid: &Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    (value & BASE_MASK == BASE_UUID).then_some((value >> 96) as u32)
}
