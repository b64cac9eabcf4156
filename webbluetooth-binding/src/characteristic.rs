use uuid::Uuid;

use crate::handle::CharacteristicHandle;

/// A GATT characteristic as reported by characteristic discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicInfo {
    pub handle: CharacteristicHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// The GATT characteristic properties bit field (Core Specification Vol 3, Part G, §3.3.1.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub reliable_write: bool,
    pub writable_auxiliaries: bool,
}

impl CharacteristicProperties {
    pub const BROADCAST: u16 = 0x0001;
    pub const READ: u16 = 0x0002;
    pub const WRITE_WITHOUT_RESPONSE: u16 = 0x0004;
    pub const WRITE: u16 = 0x0008;
    pub const NOTIFY: u16 = 0x0010;
    pub const INDICATE: u16 = 0x0020;
    pub const AUTHENTICATED_SIGNED_WRITES: u16 = 0x0040;
    /// Extended properties. Reliable write and writable auxiliaries live in the
    /// Characteristic Extended Properties descriptor and are carried in the high byte here.
    pub const RELIABLE_WRITE: u16 = 0x0100;
    pub const WRITABLE_AUXILIARIES: u16 = 0x0200;

    pub fn from_bits(bits: u16) -> Self {
        let has = |flag: u16| bits & flag != 0;
        CharacteristicProperties {
            broadcast: has(Self::BROADCAST),
            read: has(Self::READ),
            write_without_response: has(Self::WRITE_WITHOUT_RESPONSE),
            write: has(Self::WRITE),
            notify: has(Self::NOTIFY),
            indicate: has(Self::INDICATE),
            authenticated_signed_writes: has(Self::AUTHENTICATED_SIGNED_WRITES),
            reliable_write: has(Self::RELIABLE_WRITE),
            writable_auxiliaries: has(Self::WRITABLE_AUXILIARIES),
        }
    }

    pub fn bits(&self) -> u16 {
        [
            (self.broadcast, Self::BROADCAST),
            (self.read, Self::READ),
            (self.write_without_response, Self::WRITE_WITHOUT_RESPONSE),
            (self.write, Self::WRITE),
            (self.notify, Self::NOTIFY),
            (self.indicate, Self::INDICATE),
            (
                self.authenticated_signed_writes,
                Self::AUTHENTICATED_SIGNED_WRITES,
            ),
            (self.reliable_write, Self::RELIABLE_WRITE),
            (self.writable_auxiliaries, Self::WRITABLE_AUXILIARIES),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |bits, (_, flag)| bits | flag)
    }

    /// Returns `true` if the characteristic can push value updates to the client.
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// The type of a characteristic write.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    /// A write request, acknowledged by the peripheral.
    #[default]
    WithResponse,
    /// A write command. The peripheral sends no acknowledgement.
    WithoutResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_decode_gatt_bits() {
        let props = CharacteristicProperties::from_bits(0x1a);
        assert!(props.read);
        assert!(props.write);
        assert!(props.notify);
        assert!(!props.indicate);
        assert!(props.can_notify());
        assert_eq!(props.bits(), 0x1a);
    }

    #[test]
    fn extended_properties_survive_round_trip() {
        let props = CharacteristicProperties {
            reliable_write: true,
            writable_auxiliaries: true,
            ..Default::default()
        };
        assert_eq!(CharacteristicProperties::from_bits(props.bits()), props);
        assert!(!props.can_notify());
    }
}
