use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;
use webbluetooth_binding::NativeBinding;
use webbluetooth_binding::advertisement_data::PeripheralInfo;

use crate::adapter::{Adapter, BluetoothOptions};
use crate::device::BluetoothDevice;
use crate::error::Result;
use crate::events::{BluetoothEvent, BluetoothEventType, EventTarget, ListenerId};
use crate::registry::HandleId;
use crate::scan::{self, RequestDeviceOptions, Scan, ScanSession};
use crate::util::lock;

/// The entry point of the API: requests devices from one adapter.
#[derive(Clone)]
pub struct Bluetooth {
    inner: Arc<BluetoothInner>,
}

impl std::fmt::Debug for Bluetooth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bluetooth")
            .field("adapter", &self.inner.adapter)
            .field("devices", &lock(&self.inner.devices).len())
            .finish()
    }
}

impl Bluetooth {
    pub fn new(adapter: Adapter) -> Self {
        Bluetooth {
            inner: Arc::new(BluetoothInner {
                adapter,
                devices: Mutex::new(Vec::new()),
                events: Arc::new(EventTarget::new()),
            }),
        }
    }

    /// Opens an adapter of `binding` and wraps it.
    pub fn open(binding: Arc<dyn NativeBinding>, options: BluetoothOptions) -> Result<Self> {
        Adapter::open(binding, options).map(Self::new)
    }

    pub fn adapter(&self) -> &Adapter {
        &self.inner.adapter
    }

    /// Returns `true` if the radio is powered on.
    pub fn get_availability(&self) -> bool {
        self.inner.adapter.is_enabled()
    }

    /// Scans until a device matches `options` and returns it.
    ///
    /// Fails with [`NotFound`][crate::error::ErrorKind::NotFound] if nothing matches before
    /// the timeout, and with [`Cancelled`][crate::error::ErrorKind::Cancelled] if the scan
    /// is cancelled.
    pub async fn request_device(&self, options: RequestDeviceOptions) -> Result<BluetoothDevice> {
        scan::request_device(self.inner.clone(), options).await
    }

    /// Scans for the whole timeout and returns every matching device.
    pub async fn request_devices(
        &self,
        options: RequestDeviceOptions,
    ) -> Result<Vec<BluetoothDevice>> {
        scan::request_devices(self.inner.clone(), options).await
    }

    /// Starts a scan that yields each matching device until it is dropped. The timeout of
    /// `options` is ignored.
    pub fn scan(&self, options: RequestDeviceOptions) -> Result<Scan> {
        ScanSession::start(self.inner.clone(), options).map(Scan::new)
    }

    /// Cancels the running scan. Returns `false` if no scan was running.
    pub fn cancel_scan(&self) -> bool {
        self.inner.adapter.inner.cancel_scan()
    }

    /// Every device returned so far.
    pub fn get_devices(&self) -> Vec<BluetoothDevice> {
        lock(&self.inner.devices).clone()
    }

    /// Registers a listener for events bubbled from every device this object returned.
    pub fn add_event_listener(
        &self,
        event_type: BluetoothEventType,
        listener: impl Fn(&BluetoothEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.add_event_listener(event_type, listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_event_listener(id)
    }
}

pub(crate) struct BluetoothInner {
    pub(crate) adapter: Adapter,
    devices: Mutex<Vec<BluetoothDevice>>,
    events: Arc<EventTarget<BluetoothEvent>>,
}

impl BluetoothInner {
    /// Returns the device for an accepted peripheral, creating it the first time.
    pub fn accept(
        &self,
        info: PeripheralInfo,
        peripheral_id: HandleId,
        allowed_services: &HashSet<Uuid>,
    ) -> BluetoothDevice {
        let mut devices = lock(&self.devices);
        if let Some(device) = devices.iter().find(|d| d.id() == info.id) {
            device.inner.allow_services(allowed_services);
            if device.inner.peripheral_id != peripheral_id {
                debug!(device = %info.id, "device reported under a new handle");
                let _ = self.adapter.inner.release(peripheral_id);
            }
            return device.clone();
        }

        let device = BluetoothDevice::new(
            &self.adapter.inner,
            info,
            peripheral_id,
            allowed_services,
            self.events.clone(),
        );
        devices.push(device.clone());
        device
    }
}
