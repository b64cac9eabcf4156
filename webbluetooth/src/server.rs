use crate::device::BluetoothDevice;
use crate::error::Result;
use crate::events::{ListenerId, ServerEvent, ServerEventType};
use crate::service::Service;
use crate::session::Select;
use crate::uuids::{AttributeKind, ToUuid};

/// The GATT server of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServer {
    device: BluetoothDevice,
}

impl GattServer {
    pub(crate) fn new(device: BluetoothDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &BluetoothDevice {
        &self.device
    }

    pub fn connected(&self) -> bool {
        self.device.inner.is_connected()
    }

    /// Connects to the device.
    ///
    /// Resolves immediately if already connected. Concurrent calls share one connection
    /// attempt. Dropping the returned future does not abort the attempt, use
    /// [`disconnect()`][Self::disconnect] for that.
    pub async fn connect(&self) -> Result<()> {
        self.device.inner.connect().await
    }

    /// Disconnects from the device, failing every operation in flight. Listeners for
    /// `GattServerDisconnected` are notified once the link is down.
    pub fn disconnect(&self) {
        self.device.inner.disconnect();
    }

    pub async fn get_primary_service(&self, service: impl ToUuid) -> Result<Service> {
        let uuid = service.to_uuid(AttributeKind::Service)?;
        let mut found = self
            .device
            .inner
            .primary_services(Select::One(uuid))
            .await?;
        Ok(found.remove(0))
    }

    pub async fn get_primary_services(&self) -> Result<Vec<Service>> {
        self.device
            .inner
            .primary_services(Select::All(None))
            .await
    }

    pub async fn get_primary_services_matching(&self, service: impl ToUuid) -> Result<Vec<Service>> {
        let uuid = service.to_uuid(AttributeKind::Service)?;
        self.device
            .inner
            .primary_services(Select::All(Some(uuid)))
            .await
    }

    pub fn add_event_listener(
        &self,
        event_type: ServerEventType,
        listener: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.device
            .inner
            .server_events
            .add_event_listener(event_type, listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.device.inner.server_events.remove_event_listener(id)
    }
}
