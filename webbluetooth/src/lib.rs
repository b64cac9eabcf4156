//! A Web Bluetooth style GATT client.
//!
//! This crate turns the callback driven, handle based interface of a native Bluetooth stack
//! (see [`webbluetooth_binding`]) into an `async` object model: request a device with
//! [`Bluetooth::request_device()`], connect to its [`GattServer`], then walk its services,
//! characteristics and descriptors.
//!
//! The crate does not depend on a particular async runtime.
//!
//! See the `examples` directory for more complete usage examples.

mod adapter;
mod bluetooth;
mod characteristic;
mod descriptor;
mod device;
pub mod error;
pub mod events;
mod peripheral;
pub mod registry;
mod scan;
mod server;
mod service;
mod session;
mod util;
pub mod uuids;

pub use adapter::{Adapter, BluetoothOptions};
pub use bluetooth::Bluetooth;
pub use characteristic::Characteristic;
pub use descriptor::Descriptor;
pub use device::BluetoothDevice;
pub use error::{Error, ErrorKind, Result};
pub use scan::{
    DevicePredicate, ManufacturerDataFilter, RequestDeviceOptions, Scan, ScanFilter,
    ServiceDataFilter,
};
pub use server::GattServer;
pub use service::Service;
pub use util::BroadcastReceiver;
pub use webbluetooth_binding as binding;
pub use webbluetooth_binding::advertisement_data;
pub use webbluetooth_binding::{CharacteristicProperties, WriteType};
