use std::fmt::{self, Display};
use std::sync::Arc;

/// An opaque identifier issued by the native Bluetooth stack.
///
/// Handles carry no meaning of their own. Depending on the stack they are either integers
/// (e.g. pointers or table indices) or strings (e.g. object paths or platform UUIDs).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeHandle(Repr);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Repr {
    Int(u64),
    Str(Arc<str>),
}

impl From<u64> for NativeHandle {
    fn from(value: u64) -> Self {
        NativeHandle(Repr::Int(value))
    }
}

impl From<&str> for NativeHandle {
    fn from(value: &str) -> Self {
        NativeHandle(Repr::Str(value.into()))
    }
}

impl From<String> for NativeHandle {
    fn from(value: String) -> Self {
        NativeHandle(Repr::Str(value.into()))
    }
}

impl NativeHandle {
    /// Returns the integer value of this handle, if it is an integer handle.
    pub fn as_int(&self) -> Option<u64> {
        match &self.0 {
            Repr::Int(value) => Some(*value),
            Repr::Str(_) => None,
        }
    }

    /// Returns the string value of this handle, if it is a string handle.
    pub fn as_str(&self) -> Option<&str> {
        match &self.0 {
            Repr::Int(_) => None,
            Repr::Str(value) => Some(value),
        }
    }
}

impl Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Int(value) => write!(f, "{value:#x}"),
            Repr::Str(value) => f.write_str(value),
        }
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(NativeHandle);

        impl $name {
            pub fn new(handle: impl Into<NativeHandle>) -> Self {
                Self(handle.into())
            }

            pub fn as_native(&self) -> &NativeHandle {
                &self.0
            }

            pub fn into_native(self) -> NativeHandle {
                self.0
            }
        }

        impl From<NativeHandle> for $name {
            fn from(handle: NativeHandle) -> Self {
                Self(handle)
            }
        }

        impl From<$name> for NativeHandle {
            fn from(handle: $name) -> Self {
                handle.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_handle!(
    /// A handle to a local Bluetooth radio.
    AdapterHandle
);
typed_handle!(
    /// A handle to a discovered or connected remote peripheral.
    PeripheralHandle
);
typed_handle!(
    /// A handle to a GATT service of a connected peripheral.
    ServiceHandle
);
typed_handle!(
    /// A handle to a GATT characteristic of a connected peripheral.
    CharacteristicHandle
);
typed_handle!(
    /// A handle to a GATT descriptor of a connected peripheral.
    DescriptorHandle
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_and_string_handles_are_distinct() {
        let a = NativeHandle::from(7);
        let b = NativeHandle::from("7");
        assert_ne!(a, b);
        assert_eq!(a.as_int(), Some(7));
        assert_eq!(b.as_str(), Some("7"));
        assert_eq!(a.to_string(), "0x7");
        assert_eq!(b.to_string(), "7");
    }

    #[test]
    fn typed_handles_round_trip_through_native() {
        let service = ServiceHandle::new(42);
        let native: NativeHandle = service.clone().into();
        assert_eq!(ServiceHandle::from(native), service);
    }
}
