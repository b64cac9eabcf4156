use uuid::Uuid;

use crate::handle::DescriptorHandle;

/// A GATT characteristic descriptor as reported by descriptor discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorInfo {
    pub handle: DescriptorHandle,
    pub uuid: Uuid,
}
