//! The native side of a Web Bluetooth style GATT client.
//!
//! This crate defines the contract between the `webbluetooth` session layer and a platform
//! Bluetooth stack. A stack is exposed through the [`NativeBinding`] trait: every call is
//! handle-based and fire-and-forget, and every result is reported later through the
//! [`AdapterDelegate`] and [`PeripheralDelegate`] callbacks.
//!
//! A fully in-memory implementation is provided in [`simulated`] for tests and demos.
//!
//! See the `examples` directory for more complete usage examples.

pub mod advertisement_data;
mod binding;
mod characteristic;
mod delegate;
mod descriptor;
pub mod error;
mod handle;
mod service;
pub mod simulated;
pub mod uuids;

pub use binding::*;
pub use characteristic::*;
pub use delegate::*;
pub use descriptor::*;
pub use error::{Error, Result};
pub use handle::*;
pub use service::*;
