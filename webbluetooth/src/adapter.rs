use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_channel::mpsc;
use futures_lite::Stream;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webbluetooth_binding::advertisement_data::PeripheralInfo;
use webbluetooth_binding::{
    AdapterDelegate, AdapterInfo, NativeBinding, NativeHandle, PeripheralDelegate,
    PeripheralHandle,
};

use crate::error::{Error, ErrorKind, Result};
use crate::peripheral::{PeripheralAsync, PeripheralAsyncDelegate, PeripheralObserver};
use crate::registry::{HandleId, HandleMeta, HandleRegistry};
use crate::util::{BroadcastReceiver, BroadcastSender, broadcast, lock, watch};

/// Options used when opening an [`Adapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothOptions {
    /// Index into the list of adapters reported by the binding.
    pub adapter_index: usize,
    /// How long `request_device` scans when the request does not set a timeout.
    pub scan_timeout: Duration,
    /// The longest value that may be written to a characteristic or descriptor.
    pub max_value_length: usize,
}

impl Default for BluetoothOptions {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            scan_timeout: Duration::from_secs(10),
            max_value_length: 512,
        }
    }
}

/// A local Bluetooth radio.
///
/// Cloning an `Adapter` is cheap. The native adapter and every handle obtained through it
/// are released by [`close()`][Self::close], or when the last clone and the last device
/// using it are dropped.
#[derive(Clone)]
pub struct Adapter {
    pub(crate) inner: Arc<AdapterInner>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("info", &self.inner.info)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Adapter {
    /// Opens the adapter selected by `options.adapter_index`.
    pub fn open(binding: Arc<dyn NativeBinding>, options: BluetoothOptions) -> Result<Self> {
        let info = binding
            .adapters()?
            .into_iter()
            .nth(options.adapter_index)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("no Bluetooth adapter at index {}", options.adapter_index),
                )
            })?;

        let mut registry = HandleRegistry::new(binding.clone());
        registry.register(info.handle.as_native().clone(), HandleMeta::Adapter);

        let delegate = Arc::new(AdapterAsyncDelegate::new());
        binding.set_delegate(&info.handle, delegate.clone());
        info!(adapter = %info.identifier, enabled = info.enabled, "opened adapter");

        Ok(Adapter {
            inner: Arc::new(AdapterInner {
                binding,
                info,
                options,
                registry: Mutex::new(registry),
                delegate,
                next_scan: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn info(&self) -> &AdapterInfo {
        &self.inner.info
    }

    pub fn options(&self) -> &BluetoothOptions {
        &self.inner.options
    }

    /// Returns `true` if the radio is powered on.
    pub fn is_enabled(&self) -> bool {
        !self.is_closed() && self.inner.binding.is_enabled(&self.inner.info.handle)
    }

    /// A stream of radio power changes.
    pub fn availability_updates(&self) -> BroadcastReceiver<bool> {
        self.inner.delegate.availability.new_receiver()
    }

    /// A stream of every peripheral disconnection, requested or not.
    pub fn disconnections(&self) -> BroadcastReceiver<PeripheralHandle> {
        self.inner.delegate.disconnections.new_receiver()
    }

    /// Stops any scan, disconnects every device and releases every native handle.
    ///
    /// Operations on devices obtained from this adapter fail afterwards.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The number of native handles currently held.
    pub fn handle_count(&self) -> usize {
        lock(&self.inner.registry).len()
    }
}

pub(crate) struct AdapterInner {
    pub(crate) binding: Arc<dyn NativeBinding>,
    pub(crate) info: AdapterInfo,
    pub(crate) options: BluetoothOptions,
    registry: Mutex<HandleRegistry>,
    delegate: Arc<AdapterAsyncDelegate>,
    next_scan: AtomicU64,
    closed: AtomicBool,
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl AdapterInner {
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::new(ErrorKind::InvalidState, "the adapter is closed"))
        } else {
            Ok(())
        }
    }

    /// Starts a scan. Only one scan may run at a time.
    pub fn start_scan(self: &Arc<Self>, services: Option<&[Uuid]>) -> Result<ScanEvents> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded();
        let token = self.next_scan.fetch_add(1, Ordering::Relaxed);
        {
            let mut scan = lock(&self.delegate.scan);
            if scan.is_some() {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "a scan is already in progress",
                ));
            }
            *scan = Some((token, sender));
        }

        debug!(token, ?services, "starting scan");
        self.binding.start_scan(&self.info.handle, services);
        Ok(ScanEvents {
            adapter: self.clone(),
            token,
            receiver,
        })
    }

    fn stop_scan(&self, token: u64) {
        let active = {
            let mut scan = lock(&self.delegate.scan);
            if scan.as_ref().is_some_and(|(current, _)| *current == token) {
                scan.take();
                true
            } else {
                false
            }
        };
        if active {
            debug!(token, "stopping scan");
            self.binding.stop_scan(&self.info.handle);
        }
    }

    /// Cancels the running scan, if any. Its consumer sees [`ScanEvent::Cancelled`].
    pub fn cancel_scan(&self) -> bool {
        let scan = lock(&self.delegate.scan).take();
        match scan {
            Some((token, sender)) => {
                debug!(token, "cancelling scan");
                self.binding.stop_scan(&self.info.handle);
                let _ = sender.unbounded_send(ScanEvent::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Routes the callbacks of `handle` to `observer` and returns the async wrapper.
    pub fn peripheral(
        self: &Arc<Self>,
        handle: PeripheralHandle,
        observer: Weak<dyn PeripheralObserver>,
    ) -> PeripheralAsync {
        let delegate = Arc::new(PeripheralAsyncDelegate::new(observer));
        lock(&self.delegate.peripherals).insert(handle.clone(), delegate.clone());
        PeripheralAsync::new(self.clone(), handle, delegate)
    }

    pub fn detach(&self, handle: &PeripheralHandle) {
        lock(&self.delegate.peripherals).remove(handle);
    }

    pub fn register(&self, handle: NativeHandle, meta: HandleMeta) -> (HandleId, bool) {
        lock(&self.registry).register(handle, meta)
    }

    pub fn lookup(&self, id: HandleId) -> Result<NativeHandle> {
        lock(&self.registry).lookup(id).cloned()
    }

    pub fn id_of(&self, handle: &NativeHandle) -> Option<HandleId> {
        lock(&self.registry).id_of(handle)
    }

    pub fn release(&self, id: HandleId) -> Result<()> {
        lock(&self.registry).release(id)
    }

    pub fn release_many(&self, ids: impl IntoIterator<Item = HandleId>) {
        lock(&self.registry).release_many(ids);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(adapter = %self.info.identifier, "closing adapter");
        self.cancel_scan();

        let peripherals: Vec<_> = lock(&self.delegate.peripherals)
            .iter()
            .map(|(handle, delegate)| (handle.clone(), delegate.clone()))
            .collect();
        for (handle, delegate) in peripherals {
            if delegate.observer().is_some_and(|o| o.is_linked()) {
                self.binding.disconnect(&self.info.handle, &handle);
            }
            delegate.cancel_pending();
        }
        lock(&self.delegate.peripherals).clear();

        let mut registry = lock(&self.registry);
        if !registry.is_empty() {
            debug!(handles = registry.len(), "releasing native handles");
        }
        registry.release_all();
    }
}

/// An event of a running scan.
#[derive(Debug, Clone)]
pub(crate) enum ScanEvent {
    Discovered(PeripheralInfo),
    /// The native stack ended the scan, with an error or because it was stopped externally.
    Stopped(Option<webbluetooth_binding::Error>),
    Cancelled,
}

/// The events of a running scan. Dropping it stops the scan.
pub(crate) struct ScanEvents {
    adapter: Arc<AdapterInner>,
    token: u64,
    receiver: mpsc::UnboundedReceiver<ScanEvent>,
}

impl ScanEvents {
    pub fn stop(&self) {
        self.adapter.stop_scan(self.token);
    }
}

impl Stream for ScanEvents {
    type Item = ScanEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl Drop for ScanEvents {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AdapterAsyncDelegate {
    availability: BroadcastSender<bool>,
    disconnections: BroadcastSender<PeripheralHandle>,
    scan: Mutex<Option<(u64, mpsc::UnboundedSender<ScanEvent>)>>,
    peripherals: Mutex<HashMap<PeripheralHandle, Arc<PeripheralAsyncDelegate>>>,
}

impl AdapterAsyncDelegate {
    fn new() -> Self {
        Self {
            availability: watch(),
            disconnections: broadcast(16),
            scan: Mutex::new(None),
            peripherals: Default::default(),
        }
    }

    fn async_delegate(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Option<Arc<PeripheralAsyncDelegate>> {
        lock(&self.peripherals).get(peripheral).cloned()
    }
}

impl AdapterDelegate for AdapterAsyncDelegate {
    fn peripheral_delegate(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Option<Arc<dyn PeripheralDelegate>> {
        self.async_delegate(peripheral)
            .map(|d| d as Arc<dyn PeripheralDelegate>)
    }

    fn did_update_state(&self, enabled: bool) {
        info!(enabled, "adapter availability changed");
        let _ = self.availability.try_broadcast(enabled);
    }

    fn did_discover(&self, peripheral: PeripheralInfo) {
        let sender = lock(&self.scan).as_ref().map(|(_, sender)| sender.clone());
        if let Some(sender) = sender {
            let _ = sender.unbounded_send(ScanEvent::Discovered(peripheral));
        }
    }

    fn did_stop_scan(&self, error: Option<webbluetooth_binding::Error>) {
        let scan = lock(&self.scan).take();
        if let Some((token, sender)) = scan {
            match &error {
                Some(error) => warn!(token, "scan failed: {error}"),
                None => debug!(token, "scan stopped by the stack"),
            }
            let _ = sender.unbounded_send(ScanEvent::Stopped(error));
        }
    }

    fn did_connect(&self, peripheral: PeripheralHandle) {
        if let Some(delegate) = self.async_delegate(&peripheral) {
            delegate.did_connect();
        }
    }

    fn did_fail_to_connect(
        &self,
        peripheral: PeripheralHandle,
        error: webbluetooth_binding::Error,
    ) {
        if let Some(delegate) = self.async_delegate(&peripheral) {
            delegate.did_fail_to_connect(error.into());
        }
    }

    fn did_disconnect(
        &self,
        peripheral: PeripheralHandle,
        error: Option<webbluetooth_binding::Error>,
    ) {
        let _ = self.disconnections.try_broadcast(peripheral.clone());
        if let Some(delegate) = self.async_delegate(&peripheral) {
            delegate.did_disconnect(error.map(Error::from));
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::StreamExt;
    use webbluetooth_binding::simulated::{Call, SimulatedBinding, SimulatedPeripheral};

    use super::*;

    fn open() -> (Arc<SimulatedBinding>, Adapter) {
        let binding = Arc::new(SimulatedBinding::new());
        let adapter = Adapter::open(binding.clone(), BluetoothOptions::default()).unwrap();
        (binding, adapter)
    }

    #[test]
    fn open_rejects_missing_adapter() {
        let binding = Arc::new(SimulatedBinding::new());
        let options = BluetoothOptions {
            adapter_index: 3,
            ..Default::default()
        };
        let err = Adapter::open(binding, options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn only_one_scan_at_a_time() {
        let (binding, adapter) = open();
        binding.add_peripheral(SimulatedPeripheral::new("a"));

        let mut events = adapter.inner.start_scan(None).unwrap();
        let err = adapter.inner.start_scan(None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let first = futures_lite::future::block_on(events.next());
        assert!(matches!(first, Some(ScanEvent::Discovered(info)) if info.id == "a"));

        drop(events);
        assert!(!binding.is_scanning());
        assert!(adapter.inner.start_scan(None).is_ok());
    }

    #[test]
    fn cancel_scan_notifies_the_consumer() {
        let (binding, adapter) = open();
        let mut events = adapter.inner.start_scan(None).unwrap();
        assert!(adapter.inner.cancel_scan());
        assert!(!adapter.inner.cancel_scan());
        assert!(!binding.is_scanning());
        let event = futures_lite::future::block_on(events.next());
        assert!(matches!(event, Some(ScanEvent::Cancelled)));
    }

    #[test]
    fn close_releases_every_handle() {
        let (binding, adapter) = open();
        assert_eq!(adapter.handle_count(), 1);
        adapter.close();
        assert!(adapter.is_closed());
        assert_eq!(adapter.handle_count(), 0);
        assert_eq!(
            binding.count_calls(|c| matches!(c, Call::Release(_))),
            1
        );
        let err = adapter.inner.start_scan(None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn availability_follows_the_radio() {
        let (binding, adapter) = open();
        let mut updates = adapter.availability_updates();
        assert!(adapter.is_enabled());
        binding.set_enabled(false);
        assert!(!adapter.is_enabled());
        assert!(!updates.try_recv().unwrap());
    }
}
