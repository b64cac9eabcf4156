//! Event listeners for GATT objects.
//!
//! Each kind of object has a closed set of event types. Listeners are invoked synchronously
//! in registration order. A listener that panics is logged and skipped, and the remaining
//! listeners still receive the event.
//!
//! Events bubble. A characteristic value change reaches the characteristic, its service,
//! the device and the [`Bluetooth`][crate::Bluetooth] object, in that order. Service changes
//! reach the service, the GATT server and the `Bluetooth` object. Disconnections reach the
//! device and the `Bluetooth` object.

use std::fmt::Debug;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::characteristic::Characteristic;
use crate::service::Service;
use crate::util::lock;

/// An event that can be dispatched by an [`EventTarget`].
pub trait Event: Clone + Send + 'static {
    type Type: Copy + Eq + Debug + Send + Sync + 'static;

    fn event_type(&self) -> Self::Type;
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E: Event> {
    id: ListenerId,
    event_type: E::Type,
    callback: Callback<E>,
}

impl<E: Event> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Listener {
            id: self.id,
            event_type: self.event_type,
            callback: self.callback.clone(),
        }
    }
}

/// A set of listeners for the events of one object.
pub struct EventTarget<E: Event> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E: Event> Default for EventTarget<E> {
    fn default() -> Self {
        EventTarget {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Event> Debug for EventTarget<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTarget")
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}

impl<E: Event> EventTarget<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for events of type `event_type`.
    pub fn add_event_listener(
        &self,
        event_type: E::Type,
        listener: impl Fn(&E) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push(Listener {
            id,
            event_type,
            callback: Arc::new(listener),
        });
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self, event_type: E::Type) -> usize {
        lock(&self.listeners)
            .iter()
            .filter(|l| l.event_type == event_type)
            .count()
    }

    /// Delivers `event` to every listener registered for its type and returns how many
    /// were invoked.
    ///
    /// The listener list is captured before the first listener runs, so listeners may add
    /// or remove listeners without affecting this dispatch.
    pub fn dispatch(&self, event: &E) -> usize {
        let event_type = event.event_type();
        let snapshot: Vec<_> = lock(&self.listeners)
            .iter()
            .filter(|l| l.event_type == event_type)
            .cloned()
            .collect();

        for listener in &snapshot {
            let callback = &listener.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(?event_type, listener = listener.id.0, "event listener panicked");
            }
        }
        snapshot.len()
    }
}

/// A new characteristic value, from a read or a notification.
#[derive(Debug, Clone)]
pub struct ValueChanged {
    pub characteristic: Characteristic,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventType {
    GattServerDisconnected,
    /// Bubbled from the device's characteristics.
    CharacteristicValueChanged,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    GattServerDisconnected { device_id: String },
    CharacteristicValueChanged(ValueChanged),
}

impl Event for DeviceEvent {
    type Type = DeviceEventType;

    fn event_type(&self) -> DeviceEventType {
        match self {
            DeviceEvent::GattServerDisconnected { .. } => DeviceEventType::GattServerDisconnected,
            DeviceEvent::CharacteristicValueChanged(_) => {
                DeviceEventType::CharacteristicValueChanged
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventType {
    ServiceAdded,
    ServiceChanged,
    ServiceRemoved,
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ServiceAdded(Service),
    ServiceChanged(Service),
    ServiceRemoved(Service),
}

impl Event for ServerEvent {
    type Type = ServerEventType;

    fn event_type(&self) -> ServerEventType {
        match self {
            ServerEvent::ServiceAdded(_) => ServerEventType::ServiceAdded,
            ServerEvent::ServiceChanged(_) => ServerEventType::ServiceChanged,
            ServerEvent::ServiceRemoved(_) => ServerEventType::ServiceRemoved,
        }
    }
}

/// Events of a service: changes to the service itself, and value changes bubbled from its
/// characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEventType {
    ServiceAdded,
    ServiceChanged,
    ServiceRemoved,
    CharacteristicValueChanged,
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    ServiceAdded(Service),
    ServiceChanged(Service),
    ServiceRemoved(Service),
    CharacteristicValueChanged(ValueChanged),
}

impl Event for ServiceEvent {
    type Type = ServiceEventType;

    fn event_type(&self) -> ServiceEventType {
        match self {
            ServiceEvent::ServiceAdded(_) => ServiceEventType::ServiceAdded,
            ServiceEvent::ServiceChanged(_) => ServiceEventType::ServiceChanged,
            ServiceEvent::ServiceRemoved(_) => ServiceEventType::ServiceRemoved,
            ServiceEvent::CharacteristicValueChanged(_) => {
                ServiceEventType::CharacteristicValueChanged
            }
        }
    }
}

impl From<ServerEvent> for ServiceEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::ServiceAdded(service) => ServiceEvent::ServiceAdded(service),
            ServerEvent::ServiceChanged(service) => ServiceEvent::ServiceChanged(service),
            ServerEvent::ServiceRemoved(service) => ServiceEvent::ServiceRemoved(service),
        }
    }
}

/// Events of every device returned by one [`Bluetooth`][crate::Bluetooth].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BluetoothEventType {
    GattServerDisconnected,
    ServiceAdded,
    ServiceChanged,
    ServiceRemoved,
    CharacteristicValueChanged,
}

#[derive(Debug, Clone)]
pub enum BluetoothEvent {
    GattServerDisconnected { device_id: String },
    ServiceAdded(Service),
    ServiceChanged(Service),
    ServiceRemoved(Service),
    CharacteristicValueChanged(ValueChanged),
}

impl Event for BluetoothEvent {
    type Type = BluetoothEventType;

    fn event_type(&self) -> BluetoothEventType {
        match self {
            BluetoothEvent::GattServerDisconnected { .. } => {
                BluetoothEventType::GattServerDisconnected
            }
            BluetoothEvent::ServiceAdded(_) => BluetoothEventType::ServiceAdded,
            BluetoothEvent::ServiceChanged(_) => BluetoothEventType::ServiceChanged,
            BluetoothEvent::ServiceRemoved(_) => BluetoothEventType::ServiceRemoved,
            BluetoothEvent::CharacteristicValueChanged(_) => {
                BluetoothEventType::CharacteristicValueChanged
            }
        }
    }
}

impl From<ServerEvent> for BluetoothEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::ServiceAdded(service) => BluetoothEvent::ServiceAdded(service),
            ServerEvent::ServiceChanged(service) => BluetoothEvent::ServiceChanged(service),
            ServerEvent::ServiceRemoved(service) => BluetoothEvent::ServiceRemoved(service),
        }
    }
}

impl From<DeviceEvent> for BluetoothEvent {
    fn from(event: DeviceEvent) -> Self {
        match event {
            DeviceEvent::GattServerDisconnected { device_id } => {
                BluetoothEvent::GattServerDisconnected { device_id }
            }
            DeviceEvent::CharacteristicValueChanged(change) => {
                BluetoothEvent::CharacteristicValueChanged(change)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicEventType {
    CharacteristicValueChanged,
}

#[derive(Debug, Clone)]
pub enum CharacteristicEvent {
    CharacteristicValueChanged(ValueChanged),
}

impl Event for CharacteristicEvent {
    type Type = CharacteristicEventType;

    fn event_type(&self) -> CharacteristicEventType {
        match self {
            CharacteristicEvent::CharacteristicValueChanged(_) => {
                CharacteristicEventType::CharacteristicValueChanged
            }
        }
    }
}
