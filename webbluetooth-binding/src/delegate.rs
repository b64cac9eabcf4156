use std::sync::Arc;

use crate::advertisement_data::PeripheralInfo;
use crate::error::{Error, Result};
use crate::{
    CharacteristicHandle, CharacteristicInfo, DescriptorHandle, DescriptorInfo, PeripheralHandle,
    ServiceHandle, ServiceInfo,
};

/// Receives the adapter level callbacks of a [`NativeBinding`][crate::NativeBinding].
///
/// Callbacks may be invoked from any thread, including synchronously from inside the
/// binding call that caused them.
#[allow(unused_variables)]
pub trait AdapterDelegate: Send + Sync {
    /// This method is called to find the delegate for the callbacks of a peripheral.
    ///
    /// Returning `None` discards the callback.
    fn peripheral_delegate(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Option<Arc<dyn PeripheralDelegate>>;

    /// This method is called when the radio is powered on or off.
    fn did_update_state(&self, enabled: bool) {}

    /// This method is called for every advertisement received while scanning.
    ///
    /// A peripheral is reported again each time it advertises.
    fn did_discover(&self, peripheral: PeripheralInfo) {}

    /// This method is called when a scan ends without a call to `stop_scan`.
    ///
    /// `error` is `None` when the stack stopped the scan on its own (e.g. the user
    /// dismissed a system chooser).
    fn did_stop_scan(&self, error: Option<Error>) {}

    /// This method is called when a connection to a peripheral is established.
    fn did_connect(&self, peripheral: PeripheralHandle) {}

    /// This method is called when a connection to a peripheral fails.
    fn did_fail_to_connect(&self, peripheral: PeripheralHandle, error: Error) {}

    /// This method is called when a peripheral is disconnected.
    ///
    /// `error` is `None` for a disconnect requested with `disconnect`, and carries the
    /// reason when the link was lost.
    fn did_disconnect(&self, peripheral: PeripheralHandle, error: Option<Error>) {}
}

#[allow(unused_variables)]
pub trait PeripheralDelegate: Send + Sync {
    /// This method is called when the peripheral's GATT database changes.
    ///
    /// `modified` holds services that were added or changed. Their previously discovered
    /// children are invalid. `removed` holds services that no longer exist.
    fn did_modify_services(
        &self,
        peripheral: PeripheralHandle,
        modified: Vec<ServiceInfo>,
        removed: Vec<ServiceHandle>,
    ) {
    }

    fn did_discover_services(
        &self,
        peripheral: PeripheralHandle,
        result: Result<Vec<ServiceInfo>>,
    ) {
    }

    fn did_discover_included_services(
        &self,
        peripheral: PeripheralHandle,
        service: ServiceHandle,
        result: Result<Vec<ServiceInfo>>,
    ) {
    }

    fn did_discover_characteristics(
        &self,
        peripheral: PeripheralHandle,
        service: ServiceHandle,
        result: Result<Vec<CharacteristicInfo>>,
    ) {
    }

    fn did_discover_descriptors(
        &self,
        peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: Result<Vec<DescriptorInfo>>,
    ) {
    }

    fn did_read_characteristic(
        &self,
        peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: Result<Vec<u8>>,
    ) {
    }

    fn did_write_characteristic(
        &self,
        peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: Result<()>,
    ) {
    }

    /// This method is called when a `set_notify` call completes, with the new
    /// subscription state.
    fn did_update_notification_state(
        &self,
        peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: Result<bool>,
    ) {
    }

    /// This method is called for every notification or indication received.
    fn did_receive_notification(
        &self,
        peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    ) {
    }

    fn did_read_descriptor(
        &self,
        peripheral: PeripheralHandle,
        descriptor: DescriptorHandle,
        result: Result<Vec<u8>>,
    ) {
    }

    fn did_write_descriptor(
        &self,
        peripheral: PeripheralHandle,
        descriptor: DescriptorHandle,
        result: Result<()>,
    ) {
    }
}
