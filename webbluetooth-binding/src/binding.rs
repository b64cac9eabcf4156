use std::sync::Arc;

use uuid::Uuid;

use crate::delegate::AdapterDelegate;
use crate::error::Result;
use crate::{
    AdapterHandle, CharacteristicHandle, DescriptorHandle, NativeHandle, PeripheralHandle,
    ServiceHandle, WriteType,
};

/// A local Bluetooth radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub handle: AdapterHandle,
    pub identifier: String,
    pub address: Option<String>,
    pub enabled: bool,
}

/// A platform Bluetooth stack.
///
/// Every operation is fire-and-forget: the call returns immediately and its outcome is
/// reported later on the [`AdapterDelegate`] registered for the adapter, or on the
/// [`PeripheralDelegate`][crate::PeripheralDelegate] it hands out for the peripheral.
/// Completions may be delivered synchronously, before the call returns.
///
/// Handles passed to the binding remain valid until they are passed to
/// [`release()`][Self::release].
pub trait NativeBinding: Send + Sync {
    /// Enumerates the local radios.
    fn adapters(&self) -> Result<Vec<AdapterInfo>>;

    /// Installs the delegate for the callbacks of `adapter`, replacing any previous one.
    fn set_delegate(&self, adapter: &AdapterHandle, delegate: Arc<dyn AdapterDelegate>);

    fn is_enabled(&self, adapter: &AdapterHandle) -> bool;

    /// Starts discovery. If `services` is given, the stack may restrict reports to
    /// peripherals advertising one of them.
    fn start_scan(&self, adapter: &AdapterHandle, services: Option<&[Uuid]>);

    fn stop_scan(&self, adapter: &AdapterHandle);

    fn connect(&self, adapter: &AdapterHandle, peripheral: &PeripheralHandle);

    /// Disconnects or cancels a pending connection attempt.
    fn disconnect(&self, adapter: &AdapterHandle, peripheral: &PeripheralHandle);

    fn discover_services(&self, peripheral: &PeripheralHandle, services: Option<&[Uuid]>);

    fn discover_included_services(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        services: Option<&[Uuid]>,
    );

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        characteristics: Option<&[Uuid]>,
    );

    fn discover_descriptors(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    );

    fn read_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    );

    /// Writes a characteristic. Both write types complete with
    /// `did_write_characteristic`, a write without response as soon as it is queued.
    fn write_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        write_type: WriteType,
    );

    fn set_notify(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    );

    fn read_descriptor(&self, peripheral: &PeripheralHandle, descriptor: &DescriptorHandle);

    fn write_descriptor(
        &self,
        peripheral: &PeripheralHandle,
        descriptor: &DescriptorHandle,
        data: &[u8],
    );

    /// Frees a handle. The handle must not be used again. Never invokes a delegate.
    fn release(&self, handle: &NativeHandle);
}
