use std::sync::Arc;

use uuid::Uuid;
use webbluetooth_binding::{CharacteristicProperties, WriteType};

use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::events::{CharacteristicEvent, CharacteristicEventType, EventTarget, ListenerId};
use crate::registry::HandleId;
use crate::service::Service;
use crate::session::Select;
use crate::uuids::{AttributeKind, ToUuid};

/// A GATT characteristic discovered over one connection.
#[derive(Clone)]
pub struct Characteristic {
    service: Service,
    id: HandleId,
    uuid: Uuid,
    properties: CharacteristicProperties,
    events: Arc<EventTarget<CharacteristicEvent>>,
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("service", &self.service.uuid())
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("properties", &self.properties)
            .finish()
    }
}

impl PartialEq for Characteristic {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service && self.id == other.id
    }
}

impl Eq for Characteristic {}

impl Characteristic {
    pub(crate) fn new(
        service: Service,
        id: HandleId,
        uuid: Uuid,
        properties: CharacteristicProperties,
        events: Arc<EventTarget<CharacteristicEvent>>,
    ) -> Self {
        Self {
            service,
            id,
            uuid,
            properties,
            events,
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn events(&self) -> &EventTarget<CharacteristicEvent> {
        &self.events
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// The last value read, written or notified. `None` once the connection it was
    /// discovered in has ended.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.service
            .device()
            .inner
            .characteristic_state(self)
            .0
    }

    pub fn is_notifying(&self) -> bool {
        self.service
            .device()
            .inner
            .characteristic_state(self)
            .1
    }

    /// Reads the value. A value written by this client is returned from the cache until
    /// the peripheral sends a new one.
    pub async fn read_value(&self) -> Result<Vec<u8>> {
        self.service.device().inner.read_characteristic(self).await
    }

    /// Writes the value, with response if the characteristic allows it.
    pub async fn write_value(&self, value: &[u8]) -> Result<()> {
        self.service
            .device()
            .inner
            .write_characteristic(self, value, None)
            .await
    }

    pub async fn write_value_with_response(&self, value: &[u8]) -> Result<()> {
        self.service
            .device()
            .inner
            .write_characteristic(self, value, Some(WriteType::WithResponse))
            .await
    }

    pub async fn write_value_without_response(&self, value: &[u8]) -> Result<()> {
        self.service
            .device()
            .inner
            .write_characteristic(self, value, Some(WriteType::WithoutResponse))
            .await
    }

    /// Subscribes to notifications or indications. Does nothing if already subscribed.
    pub async fn start_notifications(&self) -> Result<()> {
        self.service
            .device()
            .inner
            .set_notifications(self, true)
            .await
    }

    pub async fn stop_notifications(&self) -> Result<()> {
        self.service
            .device()
            .inner
            .set_notifications(self, false)
            .await
    }

    pub async fn get_descriptor(&self, descriptor: impl ToUuid) -> Result<Descriptor> {
        let uuid = descriptor.to_uuid(AttributeKind::Descriptor)?;
        let mut found = self
            .service
            .device()
            .inner
            .descriptors(self, Select::One(uuid))
            .await?;
        Ok(found.remove(0))
    }

    pub async fn get_descriptors(&self) -> Result<Vec<Descriptor>> {
        self.service
            .device()
            .inner
            .descriptors(self, Select::All(None))
            .await
    }

    pub async fn get_descriptors_matching(&self, descriptor: impl ToUuid) -> Result<Vec<Descriptor>> {
        let uuid = descriptor.to_uuid(AttributeKind::Descriptor)?;
        self.service
            .device()
            .inner
            .descriptors(self, Select::All(Some(uuid)))
            .await
    }

    pub fn add_event_listener(
        &self,
        event_type: CharacteristicEventType,
        listener: impl Fn(&CharacteristicEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.add_event_listener(event_type, listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.events.remove_event_listener(id)
    }
}
