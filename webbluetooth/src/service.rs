use std::sync::Arc;

use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::device::BluetoothDevice;
use crate::error::Result;
use crate::events::{EventTarget, ListenerId, ServiceEvent, ServiceEventType};
use crate::registry::HandleId;
use crate::session::Select;
use crate::uuids::{AttributeKind, ToUuid};

/// A GATT service discovered over one connection.
#[derive(Clone)]
pub struct Service {
    device: BluetoothDevice,
    id: HandleId,
    generation: u64,
    uuid: Uuid,
    is_primary: bool,
    events: Arc<EventTarget<ServiceEvent>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("device", &self.device.id())
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("is_primary", &self.is_primary)
            .finish()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device && self.id == other.id && self.generation == other.generation
    }
}

impl Eq for Service {}

impl Service {
    pub(crate) fn new(
        device: BluetoothDevice,
        id: HandleId,
        generation: u64,
        uuid: Uuid,
        is_primary: bool,
        events: Arc<EventTarget<ServiceEvent>>,
    ) -> Self {
        Self {
            device,
            id,
            generation,
            uuid,
            is_primary,
            events,
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn events(&self) -> &EventTarget<ServiceEvent> {
        &self.events
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn device(&self) -> &BluetoothDevice {
        &self.device
    }

    pub async fn get_characteristic(&self, characteristic: impl ToUuid) -> Result<Characteristic> {
        let uuid = characteristic.to_uuid(AttributeKind::Characteristic)?;
        let mut found = self
            .device
            .inner
            .characteristics(self, Select::One(uuid))
            .await?;
        Ok(found.remove(0))
    }

    pub async fn get_characteristics(&self) -> Result<Vec<Characteristic>> {
        self.device
            .inner
            .characteristics(self, Select::All(None))
            .await
    }

    /// Returns every characteristic with the given UUID.
    pub async fn get_characteristics_matching(
        &self,
        characteristic: impl ToUuid,
    ) -> Result<Vec<Characteristic>> {
        let uuid = characteristic.to_uuid(AttributeKind::Characteristic)?;
        self.device
            .inner
            .characteristics(self, Select::All(Some(uuid)))
            .await
    }

    pub async fn get_included_service(&self, service: impl ToUuid) -> Result<Service> {
        let uuid = service.to_uuid(AttributeKind::Service)?;
        let mut found = self
            .device
            .inner
            .included_services(self, Select::One(uuid))
            .await?;
        Ok(found.remove(0))
    }

    pub async fn get_included_services(&self) -> Result<Vec<Service>> {
        self.device
            .inner
            .included_services(self, Select::All(None))
            .await
    }

    pub async fn get_included_services_matching(&self, service: impl ToUuid) -> Result<Vec<Service>> {
        let uuid = service.to_uuid(AttributeKind::Service)?;
        self.device
            .inner
            .included_services(self, Select::All(Some(uuid)))
            .await
    }

    /// Listeners stay attached while the service exists in the current connection.
    pub fn add_event_listener(
        &self,
        event_type: ServiceEventType,
        listener: impl Fn(&ServiceEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.add_event_listener(event_type, listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.events.remove_event_listener(id)
    }
}
