use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::error::Result;
use crate::registry::HandleId;

/// A GATT descriptor discovered over one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    characteristic: Characteristic,
    id: HandleId,
    uuid: Uuid,
}

impl Descriptor {
    pub(crate) fn new(characteristic: Characteristic, id: HandleId, uuid: Uuid) -> Self {
        Self {
            characteristic,
            id,
            uuid,
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub fn characteristic(&self) -> &Characteristic {
        &self.characteristic
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        self.characteristic
            .service()
            .device()
            .inner
            .descriptor_value(self)
    }

    pub async fn read_value(&self) -> Result<Vec<u8>> {
        self.characteristic
            .service()
            .device()
            .inner
            .read_descriptor(self)
            .await
    }

    pub async fn write_value(&self, value: &[u8]) -> Result<()> {
        self.characteristic
            .service()
            .device()
            .inner
            .write_descriptor(self, value)
            .await
    }
}
