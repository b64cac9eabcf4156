//! Errors reported by a native Bluetooth stack.

use std::fmt::Display;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Error {
    data: ErrorData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// An ATT error response from the remote GATT server.
    Att(AttError),
    AdapterUnavailable,
    NotConnected,
    ConnectionFailed,
    ConnectionTimeout,
    PeripheralDisconnected,
    PermissionDenied,
    InvalidHandle,
    NotSupported,
    Other,
}

/// An ATT protocol error code (Core Specification Vol 3, Part F, §3.4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttError(pub u8);

impl AttError {
    pub const INVALID_HANDLE: AttError = AttError(0x01);
    pub const READ_NOT_PERMITTED: AttError = AttError(0x02);
    pub const WRITE_NOT_PERMITTED: AttError = AttError(0x03);
    pub const INVALID_PDU: AttError = AttError(0x04);
    pub const INSUFFICIENT_AUTHENTICATION: AttError = AttError(0x05);
    pub const REQUEST_NOT_SUPPORTED: AttError = AttError(0x06);
    pub const INVALID_OFFSET: AttError = AttError(0x07);
    pub const INSUFFICIENT_AUTHORIZATION: AttError = AttError(0x08);
    pub const PREPARE_QUEUE_FULL: AttError = AttError(0x09);
    pub const ATTRIBUTE_NOT_FOUND: AttError = AttError(0x0a);
    pub const ATTRIBUTE_NOT_LONG: AttError = AttError(0x0b);
    pub const INSUFFICIENT_ENCRYPTION_KEY_SIZE: AttError = AttError(0x0c);
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: AttError = AttError(0x0d);
    pub const UNLIKELY_ERROR: AttError = AttError(0x0e);
    pub const INSUFFICIENT_ENCRYPTION: AttError = AttError(0x0f);
    pub const UNSUPPORTED_GROUP_TYPE: AttError = AttError(0x10);
    pub const INSUFFICIENT_RESOURCES: AttError = AttError(0x11);

    /// Returns `true` for the errors a server uses to refuse access to an unpaired or
    /// unauthorized client.
    pub fn is_security(self) -> bool {
        matches!(
            self,
            AttError::INSUFFICIENT_AUTHENTICATION
                | AttError::INSUFFICIENT_AUTHORIZATION
                | AttError::INSUFFICIENT_ENCRYPTION
                | AttError::INSUFFICIENT_ENCRYPTION_KEY_SIZE
        )
    }
}

#[derive(Debug, Clone)]
enum ErrorData {
    Native {
        kind: ErrorKind,
        code: i32,
        message: Arc<str>,
    },
    Simple(ErrorKind),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Native {
                kind,
                code,
                message,
            } => write!(f, "{message} ({kind}, native code {code})"),
            ErrorData::Simple(kind) => kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind),
        }
    }
}

impl From<AttError> for Error {
    fn from(error: AttError) -> Self {
        ErrorKind::Att(error).into()
    }
}

impl Error {
    /// Creates an error carrying the stack's own code and message.
    pub fn native(kind: ErrorKind, code: i32, message: impl Into<Arc<str>>) -> Self {
        Self {
            data: ErrorData::Native {
                kind,
                code,
                message: message.into(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Native { kind, .. } => *kind,
            ErrorData::Simple(kind) => *kind,
        }
    }

    pub fn code(&self) -> Option<i32> {
        match &self.data {
            ErrorData::Native { code, .. } => Some(*code),
            ErrorData::Simple(_) => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match &self.data {
            ErrorData::Native { message, .. } => Some(message),
            ErrorData::Simple(_) => None,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Att(att_error) => att_error.fmt(f),
            ErrorKind::AdapterUnavailable => f.write_str("adapter unavailable"),
            ErrorKind::NotConnected => f.write_str("not connected"),
            ErrorKind::ConnectionFailed => f.write_str("connection failed"),
            ErrorKind::ConnectionTimeout => f.write_str("connection timeout"),
            ErrorKind::PeripheralDisconnected => f.write_str("peripheral disconnected"),
            ErrorKind::PermissionDenied => f.write_str("permission denied"),
            ErrorKind::InvalidHandle => f.write_str("invalid handle"),
            ErrorKind::NotSupported => f.write_str("operation not supported"),
            ErrorKind::Other => f.write_str("other error"),
        }
    }
}

impl Display for AttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            AttError::INVALID_HANDLE => f.write_str("invalid handle"),
            AttError::READ_NOT_PERMITTED => f.write_str("read not permitted"),
            AttError::WRITE_NOT_PERMITTED => f.write_str("write not permitted"),
            AttError::INVALID_PDU => f.write_str("invalid PDU"),
            AttError::INSUFFICIENT_AUTHENTICATION => f.write_str("insufficient authentication"),
            AttError::REQUEST_NOT_SUPPORTED => f.write_str("request not supported"),
            AttError::INVALID_OFFSET => f.write_str("invalid offset"),
            AttError::INSUFFICIENT_AUTHORIZATION => f.write_str("insufficient authorization"),
            AttError::PREPARE_QUEUE_FULL => f.write_str("prepare queue full"),
            AttError::ATTRIBUTE_NOT_FOUND => f.write_str("attribute not found"),
            AttError::ATTRIBUTE_NOT_LONG => f.write_str("attribute not long"),
            AttError::INSUFFICIENT_ENCRYPTION_KEY_SIZE => {
                f.write_str("insufficient encryption key size")
            }
            AttError::INVALID_ATTRIBUTE_VALUE_LENGTH => {
                f.write_str("invalid attribute value length")
            }
            AttError::UNLIKELY_ERROR => f.write_str("unlikely error"),
            AttError::INSUFFICIENT_ENCRYPTION => f.write_str("insufficient encryption"),
            AttError::UNSUPPORTED_GROUP_TYPE => f.write_str("unsupported group type"),
            AttError::INSUFFICIENT_RESOURCES => f.write_str("insufficient resources"),
            _ => write!(f, "unknown ATT error ({:#04x})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_errors_keep_code_and_message() {
        let err = Error::native(ErrorKind::ConnectionFailed, -5, "link setup failed");
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(err.code(), Some(-5));
        assert_eq!(
            err.to_string(),
            "link setup failed (connection failed, native code -5)"
        );
    }

    #[test]
    fn att_errors_display_and_classify() {
        let err = Error::from(AttError::READ_NOT_PERMITTED);
        assert_eq!(err.to_string(), "read not permitted");
        assert_eq!(AttError(0x80).to_string(), "unknown ATT error (0x80)");
        assert!(AttError::INSUFFICIENT_ENCRYPTION.is_security());
        assert!(!AttError::INVALID_PDU.is_security());
    }
}
