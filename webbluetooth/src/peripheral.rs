use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use futures_channel::oneshot;
use tracing::debug;
use uuid::Uuid;
use webbluetooth_binding::Result as NativeResult;
use webbluetooth_binding::{
    CharacteristicHandle, CharacteristicInfo, DescriptorHandle, DescriptorInfo, PeripheralDelegate,
    PeripheralHandle, ServiceHandle, ServiceInfo, WriteType,
};

use crate::adapter::AdapterInner;
use crate::error::{Error, Result};
use crate::util::lock;

/// Receives the unsolicited events of a peripheral: connection changes, notifications and
/// changes to its GATT database.
///
/// Called synchronously from the native callback thread.
pub(crate) trait PeripheralObserver: Send + Sync {
    fn did_connect(self: Arc<Self>);

    fn did_fail_to_connect(self: Arc<Self>, error: Error);

    fn did_disconnect(self: Arc<Self>, error: Option<Error>);

    fn did_receive_notification(self: Arc<Self>, characteristic: CharacteristicHandle, value: Vec<u8>);

    fn did_modify_services(self: Arc<Self>, modified: Vec<ServiceInfo>, removed: Vec<ServiceHandle>);

    /// Returns `true` while a link to the peripheral exists or is being set up.
    fn is_linked(&self) -> bool;
}

/// An asynchronous wrapper around a native peripheral handle.
///
/// Every GATT operation registers its completion before issuing the native call, then waits
/// for the matching delegate callback.
#[derive(Clone)]
pub(crate) struct PeripheralAsync {
    adapter: Arc<AdapterInner>,
    handle: PeripheralHandle,
    delegate: Arc<PeripheralAsyncDelegate>,
}

impl std::fmt::Debug for PeripheralAsync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralAsync")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PeripheralAsync {
    pub fn new(
        adapter: Arc<AdapterInner>,
        handle: PeripheralHandle,
        delegate: Arc<PeripheralAsyncDelegate>,
    ) -> Self {
        PeripheralAsync {
            adapter,
            handle,
            delegate,
        }
    }

    pub fn adapter(&self) -> &Arc<AdapterInner> {
        &self.adapter
    }

    pub fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// Starts connecting. The outcome is reported to the peripheral's observer.
    pub fn connect(&self) -> Result<()> {
        self.adapter.ensure_open()?;
        debug!(peripheral = %self.handle, "connect");
        self.adapter
            .binding
            .connect(&self.adapter.info.handle, &self.handle);
        Ok(())
    }

    /// Disconnects or aborts a connection attempt. The outcome is reported to the
    /// peripheral's observer.
    pub fn disconnect(&self) {
        debug!(peripheral = %self.handle, "disconnect");
        self.adapter
            .binding
            .disconnect(&self.adapter.info.handle, &self.handle);
    }

    /// Abandons every pending GATT operation. Their callers see a network error.
    pub fn cancel_pending(&self) {
        self.delegate.cancel_pending();
    }

    pub async fn discover_services(&self, services: Option<&[Uuid]>) -> Result<Vec<ServiceInfo>> {
        let receiver = self.delegate.register_service_discovery();
        self.adapter
            .binding
            .discover_services(&self.handle, services);
        receiver.await?
    }

    pub async fn discover_included_services(
        &self,
        service: &ServiceHandle,
    ) -> Result<Vec<ServiceInfo>> {
        let receiver = register(
            &self.delegate.included_service_discovery,
            service.clone(),
        );
        self.adapter
            .binding
            .discover_included_services(&self.handle, service, None);
        receiver.await?
    }

    pub async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
    ) -> Result<Vec<CharacteristicInfo>> {
        let receiver = register(&self.delegate.characteristic_discovery, service.clone());
        self.adapter
            .binding
            .discover_characteristics(&self.handle, service, None);
        receiver.await?
    }

    pub async fn discover_descriptors(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<DescriptorInfo>> {
        let receiver = register(
            &self.delegate.descriptor_discovery,
            characteristic.clone(),
        );
        self.adapter
            .binding
            .discover_descriptors(&self.handle, characteristic);
        receiver.await?
    }

    pub async fn read_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<u8>> {
        let receiver = register(&self.delegate.characteristic_reads, characteristic.clone());
        self.adapter
            .binding
            .read_characteristic(&self.handle, characteristic);
        receiver.await?
    }

    pub async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let receiver = register(&self.delegate.characteristic_writes, characteristic.clone());
        self.adapter
            .binding
            .write_characteristic(&self.handle, characteristic, data, write_type);
        receiver.await?
    }

    pub async fn set_notify(
        &self,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<bool> {
        let receiver = register(&self.delegate.notification_updates, characteristic.clone());
        self.adapter
            .binding
            .set_notify(&self.handle, characteristic, enabled);
        receiver.await?
    }

    pub async fn read_descriptor(&self, descriptor: &DescriptorHandle) -> Result<Vec<u8>> {
        let receiver = register(&self.delegate.descriptor_reads, descriptor.clone());
        self.adapter
            .binding
            .read_descriptor(&self.handle, descriptor);
        receiver.await?
    }

    pub async fn write_descriptor(&self, descriptor: &DescriptorHandle, data: &[u8]) -> Result<()> {
        let receiver = register(&self.delegate.descriptor_writes, descriptor.clone());
        self.adapter
            .binding
            .write_descriptor(&self.handle, descriptor, data);
        receiver.await?
    }
}

type OneshotMap<K, V> = Mutex<HashMap<K, oneshot::Sender<Result<V>>>>;

fn register<K: Eq + Hash, V>(map: &OneshotMap<K, V>, key: K) -> oneshot::Receiver<Result<V>> {
    let (sender, receiver) = oneshot::channel();
    lock(map).insert(key, sender);
    receiver
}

fn complete<K: Eq + Hash, V>(map: &OneshotMap<K, V>, key: &K, result: NativeResult<V>) {
    let sender = lock(map).remove(key);
    if let Some(sender) = sender {
        let _ = sender.send(result.map_err(Into::into));
    }
}

pub(crate) struct PeripheralAsyncDelegate {
    observer: Weak<dyn PeripheralObserver>,
    service_discovery: Mutex<Option<oneshot::Sender<Result<Vec<ServiceInfo>>>>>,
    included_service_discovery: OneshotMap<ServiceHandle, Vec<ServiceInfo>>,
    characteristic_discovery: OneshotMap<ServiceHandle, Vec<CharacteristicInfo>>,
    descriptor_discovery: OneshotMap<CharacteristicHandle, Vec<DescriptorInfo>>,
    characteristic_reads: OneshotMap<CharacteristicHandle, Vec<u8>>,
    characteristic_writes: OneshotMap<CharacteristicHandle, ()>,
    notification_updates: OneshotMap<CharacteristicHandle, bool>,
    descriptor_reads: OneshotMap<DescriptorHandle, Vec<u8>>,
    descriptor_writes: OneshotMap<DescriptorHandle, ()>,
}

impl PeripheralAsyncDelegate {
    pub fn new(observer: Weak<dyn PeripheralObserver>) -> Self {
        Self {
            observer,
            service_discovery: Default::default(),
            included_service_discovery: Default::default(),
            characteristic_discovery: Default::default(),
            descriptor_discovery: Default::default(),
            characteristic_reads: Default::default(),
            characteristic_writes: Default::default(),
            notification_updates: Default::default(),
            descriptor_reads: Default::default(),
            descriptor_writes: Default::default(),
        }
    }

    pub fn observer(&self) -> Option<Arc<dyn PeripheralObserver>> {
        self.observer.upgrade()
    }

    fn register_service_discovery(&self) -> oneshot::Receiver<Result<Vec<ServiceInfo>>> {
        let (sender, receiver) = oneshot::channel();
        *lock(&self.service_discovery) = Some(sender);
        receiver
    }

    /// Drops every pending completion.
    pub fn cancel_pending(&self) {
        lock(&self.service_discovery).take();
        lock(&self.included_service_discovery).clear();
        lock(&self.characteristic_discovery).clear();
        lock(&self.descriptor_discovery).clear();
        lock(&self.characteristic_reads).clear();
        lock(&self.characteristic_writes).clear();
        lock(&self.notification_updates).clear();
        lock(&self.descriptor_reads).clear();
        lock(&self.descriptor_writes).clear();
    }

    pub fn did_connect(&self) {
        if let Some(observer) = self.observer() {
            observer.did_connect();
        }
    }

    pub fn did_fail_to_connect(&self, error: Error) {
        if let Some(observer) = self.observer() {
            observer.did_fail_to_connect(error);
        }
    }

    pub fn did_disconnect(&self, error: Option<Error>) {
        self.cancel_pending();
        if let Some(observer) = self.observer() {
            observer.did_disconnect(error);
        }
    }
}

impl PeripheralDelegate for PeripheralAsyncDelegate {
    fn did_modify_services(
        &self,
        _peripheral: PeripheralHandle,
        modified: Vec<ServiceInfo>,
        removed: Vec<ServiceHandle>,
    ) {
        if let Some(observer) = self.observer() {
            observer.did_modify_services(modified, removed);
        }
    }

    fn did_discover_services(
        &self,
        _peripheral: PeripheralHandle,
        result: NativeResult<Vec<ServiceInfo>>,
    ) {
        let sender = lock(&self.service_discovery).take();
        if let Some(sender) = sender {
            let _ = sender.send(result.map_err(Into::into));
        }
    }

    fn did_discover_included_services(
        &self,
        _peripheral: PeripheralHandle,
        service: ServiceHandle,
        result: NativeResult<Vec<ServiceInfo>>,
    ) {
        complete(&self.included_service_discovery, &service, result);
    }

    fn did_discover_characteristics(
        &self,
        _peripheral: PeripheralHandle,
        service: ServiceHandle,
        result: NativeResult<Vec<CharacteristicInfo>>,
    ) {
        complete(&self.characteristic_discovery, &service, result);
    }

    fn did_discover_descriptors(
        &self,
        _peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: NativeResult<Vec<DescriptorInfo>>,
    ) {
        complete(&self.descriptor_discovery, &characteristic, result);
    }

    fn did_read_characteristic(
        &self,
        _peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: NativeResult<Vec<u8>>,
    ) {
        complete(&self.characteristic_reads, &characteristic, result);
    }

    fn did_write_characteristic(
        &self,
        _peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: NativeResult<()>,
    ) {
        complete(&self.characteristic_writes, &characteristic, result);
    }

    fn did_update_notification_state(
        &self,
        _peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        result: NativeResult<bool>,
    ) {
        complete(&self.notification_updates, &characteristic, result);
    }

    fn did_receive_notification(
        &self,
        _peripheral: PeripheralHandle,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    ) {
        if let Some(observer) = self.observer() {
            observer.did_receive_notification(characteristic, value);
        }
    }

    fn did_read_descriptor(
        &self,
        _peripheral: PeripheralHandle,
        descriptor: DescriptorHandle,
        result: NativeResult<Vec<u8>>,
    ) {
        complete(&self.descriptor_reads, &descriptor, result);
    }

    fn did_write_descriptor(
        &self,
        _peripheral: PeripheralHandle,
        descriptor: DescriptorHandle,
        result: NativeResult<()>,
    ) {
        complete(&self.descriptor_writes, &descriptor, result);
    }
}
