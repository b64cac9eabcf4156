use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;
use webbluetooth_binding::advertisement_data::{AdvertisementData, PeripheralInfo};

use crate::adapter::AdapterInner;
use crate::events::{
    BluetoothEvent, DeviceEvent, DeviceEventType, EventTarget, ListenerId, ServerEvent,
};
use crate::peripheral::{PeripheralAsync, PeripheralObserver};
use crate::registry::HandleId;
use crate::server::GattServer;
use crate::session::Session;
use crate::util::lock;

/// A remote Bluetooth device returned by a device request.
///
/// The same device is returned for every request that accepts it. Its identity fields
/// are fixed when it is first accepted.
#[derive(Clone)]
pub struct BluetoothDevice {
    pub(crate) inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for BluetoothDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluetoothDevice")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("connected", &self.gatt().connected())
            .finish()
    }
}

impl PartialEq for BluetoothDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for BluetoothDevice {}

impl BluetoothDevice {
    pub(crate) fn new(
        adapter: &Arc<AdapterInner>,
        info: PeripheralInfo,
        peripheral_id: HandleId,
        allowed_services: &HashSet<Uuid>,
        bluetooth_events: Arc<EventTarget<BluetoothEvent>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<DeviceInner>| {
            let observer: Weak<dyn PeripheralObserver> = weak.clone();
            let peripheral = adapter.peripheral(info.handle.clone(), observer);
            DeviceInner {
                info,
                peripheral_id,
                peripheral,
                session: Session::default(),
                events: EventTarget::new(),
                server_events: EventTarget::new(),
                bluetooth_events,
                allowed_services: Mutex::new(allowed_services.clone()),
            }
        });
        BluetoothDevice { inner }
    }

    /// The platform identifier of the device: its address, or a UUID assigned by the
    /// platform where addresses are hidden.
    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.info.display_name()
    }

    /// The signal strength when the device was first accepted.
    pub fn rssi(&self) -> Option<i16> {
        self.inner.info.rssi
    }

    pub fn tx_power(&self) -> Option<i16> {
        self.inner.info.advertisement.tx_power_level
    }

    pub fn advertisement(&self) -> &AdvertisementData {
        &self.inner.info.advertisement
    }

    pub fn gatt(&self) -> GattServer {
        GattServer::new(self.clone())
    }

    /// The primary services the application may access. Empty means unrestricted.
    pub fn allowed_services(&self) -> HashSet<Uuid> {
        lock(&self.inner.allowed_services).clone()
    }

    pub fn add_event_listener(
        &self,
        event_type: DeviceEventType,
        listener: impl Fn(&DeviceEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.add_event_listener(event_type, listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_event_listener(id)
    }
}

pub(crate) struct DeviceInner {
    pub(crate) info: PeripheralInfo,
    pub(crate) peripheral_id: HandleId,
    pub(crate) peripheral: PeripheralAsync,
    pub(crate) session: Session,
    pub(crate) events: EventTarget<DeviceEvent>,
    pub(crate) server_events: EventTarget<ServerEvent>,
    /// Shared with the `Bluetooth` object that returned the device.
    pub(crate) bluetooth_events: Arc<EventTarget<BluetoothEvent>>,
    allowed_services: Mutex<HashSet<Uuid>>,
}

impl DeviceInner {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn adapter(&self) -> &Arc<AdapterInner> {
        self.peripheral.adapter()
    }

    /// Grants access to more services. An empty set lifts the restriction for good.
    pub fn allow_services(&self, services: &HashSet<Uuid>) {
        let mut allowed = lock(&self.allowed_services);
        if allowed.is_empty() {
            return;
        }
        if services.is_empty() {
            allowed.clear();
        } else {
            allowed.extend(services.iter().copied());
        }
    }

    pub fn allowed_services(&self) -> HashSet<Uuid> {
        lock(&self.allowed_services).clone()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let adapter = self.peripheral.adapter();
        let (linked, ids) = self.session.reset();
        adapter.detach(self.peripheral.handle());
        if linked {
            self.peripheral.disconnect();
        }
        if !ids.is_empty() {
            adapter.release_many(ids);
        }
        // Fails once the adapter has been closed, which released it already.
        let _ = adapter.release(self.peripheral_id);
    }
}
