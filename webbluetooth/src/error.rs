//! Error types for this crate.

use std::borrow::Cow;
use std::fmt::Display;

use futures_channel::oneshot;
use webbluetooth_binding::error::{AttError, ErrorKind as NativeErrorKind};

/// A convenience type alias for a `Result` with an `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate.
#[derive(Debug, Clone)]
pub struct Error {
    data: ErrorData,
}

/// The kind of error that occurred.
///
/// These mirror the `DOMException` names used by Web Bluetooth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// No matching device, service, characteristic or descriptor was found.
    NotFound,
    /// The device is not connected, was disconnected during the operation, or the native
    /// stack failed the request.
    Network,
    /// The object is in the wrong state for the operation.
    InvalidState,
    /// The operation was cancelled.
    Cancelled,
    /// Access to the attribute is not allowed.
    Security,
    /// The attribute does not support the operation.
    NotSupported,
    /// A value is too long to be written.
    InvalidModification,
    /// The arguments of the operation are malformed.
    InvalidArgument,
}

#[derive(Debug, Clone)]
enum ErrorData {
    Native(webbluetooth_binding::Error),
    Simple(ErrorKind, Cow<'static, str>),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Native(error) => error.fmt(f),
            ErrorData::Simple(kind, message) if message.is_empty() => kind.fmt(f),
            ErrorData::Simple(kind, message) => write!(f, "{kind}: {message}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.data {
            ErrorData::Native(error) => Some(error),
            ErrorData::Simple(..) => None,
        }
    }
}

impl From<webbluetooth_binding::Error> for Error {
    fn from(error: webbluetooth_binding::Error) -> Self {
        Error {
            data: ErrorData::Native(error),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind, Cow::Borrowed("")),
        }
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(_value: oneshot::Canceled) -> Self {
        Error::new(ErrorKind::Network, "operation abandoned by disconnection")
    }
}

impl Error {
    /// Creates an error of the given kind with a message.
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Error {
            data: ErrorData::Simple(kind, message.into()),
        }
    }

    /// If this error was reported by the native stack, returns a reference to it.
    pub fn get_ref(&self) -> Option<&webbluetooth_binding::Error> {
        match &self.data {
            ErrorData::Native(error) => Some(error),
            ErrorData::Simple(..) => None,
        }
    }

    /// If this error was reported by the native stack, returns it.
    pub fn into_inner(self) -> Option<webbluetooth_binding::Error> {
        match self.data {
            ErrorData::Native(error) => Some(error),
            ErrorData::Simple(..) => None,
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Native(error) => error.kind().into(),
            ErrorData::Simple(kind, _) => *kind,
        }
    }
}

impl From<NativeErrorKind> for ErrorKind {
    fn from(kind: NativeErrorKind) -> Self {
        match kind {
            NativeErrorKind::PermissionDenied => ErrorKind::Security,
            NativeErrorKind::Att(att) if att.is_security() => ErrorKind::Security,
            NativeErrorKind::NotSupported => ErrorKind::NotSupported,
            NativeErrorKind::Att(AttError::REQUEST_NOT_SUPPORTED) => ErrorKind::NotSupported,
            NativeErrorKind::AdapterUnavailable => ErrorKind::InvalidState,
            NativeErrorKind::Att(_)
            | NativeErrorKind::NotConnected
            | NativeErrorKind::ConnectionFailed
            | NativeErrorKind::ConnectionTimeout
            | NativeErrorKind::PeripheralDisconnected
            | NativeErrorKind::InvalidHandle
            | NativeErrorKind::Other => ErrorKind::Network,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => f.write_str("not found"),
            ErrorKind::Network => f.write_str("network error"),
            ErrorKind::InvalidState => f.write_str("invalid state"),
            ErrorKind::Cancelled => f.write_str("cancelled"),
            ErrorKind::Security => f.write_str("security error"),
            ErrorKind::NotSupported => f.write_str("not supported"),
            ErrorKind::InvalidModification => f.write_str("invalid modification"),
            ErrorKind::InvalidArgument => f.write_str("invalid argument"),
        }
    }
}
