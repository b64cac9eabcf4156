use uuid::Uuid;

use crate::handle::ServiceHandle;

/// A GATT service as reported by service or included service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInfo {
    pub handle: ServiceHandle,
    pub uuid: Uuid,
    pub is_primary: bool,
}
