//! An in-memory Bluetooth stack.
//!
//! [`SimulatedBinding`] implements [`NativeBinding`] over a set of scripted peripherals. It
//! records every native call, can inject failures into the next call of a given kind, can
//! hold completions back until the test releases them, and can push notifications, link
//! loss and GATT database changes.
//!
//! Completions are delivered synchronously from inside the binding call unless the
//! operation is held with [`SimulatedBinding::hold()`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::advertisement_data::{AdvertisementData, ManufacturerData, PeripheralInfo};
use crate::error::{AttError, Error, ErrorKind, Result};
use crate::{
    AdapterDelegate, AdapterHandle, AdapterInfo, CharacteristicHandle, CharacteristicInfo,
    CharacteristicProperties, DescriptorHandle, DescriptorInfo, NativeBinding, NativeHandle,
    PeripheralDelegate, PeripheralHandle, ServiceHandle, ServiceInfo, WriteType,
};

/// A native operation whose completion can be failed or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StartScan,
    Connect,
    DiscoverServices,
    DiscoverIncludedServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    ReadCharacteristic,
    WriteCharacteristic,
    SetNotify,
    ReadDescriptor,
    WriteDescriptor,
}

/// A recorded native call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(Option<Vec<Uuid>>),
    StopScan,
    Connect(PeripheralHandle),
    Disconnect(PeripheralHandle),
    DiscoverServices(PeripheralHandle, Option<Vec<Uuid>>),
    DiscoverIncludedServices(ServiceHandle),
    DiscoverCharacteristics(ServiceHandle, Option<Vec<Uuid>>),
    DiscoverDescriptors(CharacteristicHandle),
    ReadCharacteristic(CharacteristicHandle),
    WriteCharacteristic(CharacteristicHandle, Vec<u8>, WriteType),
    SetNotify(CharacteristicHandle, bool),
    ReadDescriptor(DescriptorHandle),
    WriteDescriptor(DescriptorHandle, Vec<u8>),
    Release(NativeHandle),
}

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    id: String,
    name: Option<String>,
    rssi: Option<i16>,
    advertisement: AdvertisementData,
    advertising: bool,
    services: Vec<SimulatedService>,
}

impl SimulatedPeripheral {
    pub fn new(id: impl Into<String>) -> Self {
        SimulatedPeripheral {
            id: id.into(),
            name: None,
            rssi: None,
            advertisement: AdvertisementData {
                is_connectable: true,
                ..Default::default()
            },
            advertising: true,
            services: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.advertisement.local_name = Some(name.clone());
        self.name = Some(name);
        self
    }

    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn tx_power_level(mut self, level: i16) -> Self {
        self.advertisement.tx_power_level = Some(level);
        self
    }

    /// Adds a service UUID to the advertisement.
    pub fn advertise_service(mut self, uuid: Uuid) -> Self {
        self.advertisement.service_uuids.push(uuid);
        self
    }

    pub fn manufacturer_data(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.advertisement.manufacturer_data.push(ManufacturerData {
            company_id,
            data: data.into(),
        });
        self
    }

    pub fn service_data(mut self, uuid: Uuid, data: impl Into<Vec<u8>>) -> Self {
        self.advertisement.service_data.insert(uuid, data.into());
        self
    }

    /// Keeps the peripheral quiet until [`SimulatedBinding::advertise()`] is called.
    pub fn silent(mut self) -> Self {
        self.advertising = false;
        self
    }

    /// Adds a service to the peripheral's GATT database.
    pub fn service(mut self, service: SimulatedService) -> Self {
        self.services.push(service);
        self
    }
}

/// A scripted GATT service.
#[derive(Debug, Clone)]
pub struct SimulatedService {
    uuid: Uuid,
    is_primary: bool,
    includes: Vec<Uuid>,
    characteristics: Vec<SimulatedCharacteristic>,
}

impl SimulatedService {
    pub fn primary(uuid: Uuid) -> Self {
        SimulatedService {
            uuid,
            is_primary: true,
            includes: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        SimulatedService {
            is_primary: false,
            ..Self::primary(uuid)
        }
    }

    /// Includes another service of the same peripheral by UUID.
    pub fn include(mut self, uuid: Uuid) -> Self {
        self.includes.push(uuid);
        self
    }

    pub fn characteristic(mut self, characteristic: SimulatedCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// A scripted GATT characteristic.
#[derive(Debug, Clone)]
pub struct SimulatedCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    descriptors: Vec<(Uuid, Vec<u8>)>,
}

impl SimulatedCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        SimulatedCharacteristic {
            uuid,
            properties,
            value: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn descriptor(mut self, uuid: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.descriptors.push((uuid, value.into()));
        self
    }
}

type Completion = Box<dyn FnOnce(&SimulatedBinding) + Send>;

struct HeldCompletion {
    peripheral: Option<PeripheralHandle>,
    completion: Completion,
}

struct PeripheralEntry {
    info: PeripheralInfo,
    advertising: bool,
    connected: bool,
    connecting: bool,
    services: Vec<ServiceEntry>,
}

struct ServiceEntry {
    handle: ServiceHandle,
    uuid: Uuid,
    is_primary: bool,
    includes: Vec<Uuid>,
    characteristics: Vec<CharacteristicEntry>,
}

struct CharacteristicEntry {
    handle: CharacteristicHandle,
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    notifying: bool,
    descriptors: Vec<DescriptorEntry>,
}

struct DescriptorEntry {
    handle: DescriptorHandle,
    uuid: Uuid,
    value: Vec<u8>,
}

impl ServiceEntry {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            handle: self.handle.clone(),
            uuid: self.uuid,
            is_primary: self.is_primary,
        }
    }
}

impl CharacteristicEntry {
    fn info(&self) -> CharacteristicInfo {
        CharacteristicInfo {
            handle: self.handle.clone(),
            uuid: self.uuid,
            properties: self.properties,
        }
    }
}

struct State {
    adapter: AdapterInfo,
    delegate: Option<Arc<dyn AdapterDelegate>>,
    scanning: bool,
    scan_services: Option<Vec<Uuid>>,
    next_handle: u64,
    peripherals: Vec<PeripheralEntry>,
    calls: Vec<Call>,
    failures: HashMap<Operation, VecDeque<Error>>,
    holds: HashSet<Operation>,
    held: Vec<HeldCompletion>,
}

impl State {
    fn alloc(&mut self) -> NativeHandle {
        self.next_handle += 1;
        NativeHandle::from(self.next_handle)
    }

    fn build_service(&mut self, service: SimulatedService) -> ServiceEntry {
        let handle = ServiceHandle::new(self.alloc());
        let characteristics = service
            .characteristics
            .into_iter()
            .map(|c| {
                let handle = CharacteristicHandle::new(self.alloc());
                let descriptors = c
                    .descriptors
                    .into_iter()
                    .map(|(uuid, value)| DescriptorEntry {
                        handle: DescriptorHandle::new(self.alloc()),
                        uuid,
                        value,
                    })
                    .collect();
                CharacteristicEntry {
                    handle,
                    uuid: c.uuid,
                    properties: c.properties,
                    value: c.value,
                    notifying: false,
                    descriptors,
                }
            })
            .collect();

        ServiceEntry {
            handle,
            uuid: service.uuid,
            is_primary: service.is_primary,
            includes: service.includes,
            characteristics,
        }
    }

    fn peripheral(&self, peripheral: &PeripheralHandle) -> Result<&PeripheralEntry> {
        self.peripherals
            .iter()
            .find(|p| &p.info.handle == peripheral)
            .ok_or_else(|| ErrorKind::InvalidHandle.into())
    }

    fn peripheral_mut(&mut self, peripheral: &PeripheralHandle) -> Result<&mut PeripheralEntry> {
        self.peripherals
            .iter_mut()
            .find(|p| &p.info.handle == peripheral)
            .ok_or_else(|| ErrorKind::InvalidHandle.into())
    }

    fn connected(&self, peripheral: &PeripheralHandle) -> Result<&PeripheralEntry> {
        let entry = self.peripheral(peripheral)?;
        if entry.connected {
            Ok(entry)
        } else {
            Err(ErrorKind::NotConnected.into())
        }
    }

    fn connected_mut(&mut self, peripheral: &PeripheralHandle) -> Result<&mut PeripheralEntry> {
        let entry = self.peripheral_mut(peripheral)?;
        if entry.connected {
            Ok(entry)
        } else {
            Err(ErrorKind::NotConnected.into())
        }
    }

    fn characteristic_mut(
        &mut self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<&mut CharacteristicEntry> {
        self.connected_mut(peripheral)?
            .services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| &c.handle == characteristic)
            .ok_or_else(|| ErrorKind::InvalidHandle.into())
    }

    fn descriptor_mut(
        &mut self,
        peripheral: &PeripheralHandle,
        descriptor: &DescriptorHandle,
    ) -> Result<&mut DescriptorEntry> {
        self.connected_mut(peripheral)?
            .services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .flat_map(|c| c.descriptors.iter_mut())
            .find(|d| &d.handle == descriptor)
            .ok_or_else(|| ErrorKind::InvalidHandle.into())
    }

    fn take_failure(&mut self, op: Operation) -> Option<Error> {
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn scan_matches(&self, peripheral: &PeripheralEntry) -> bool {
        match &self.scan_services {
            Some(services) if !services.is_empty() => services
                .iter()
                .any(|uuid| peripheral.info.advertisement.service_uuids.contains(uuid)),
            _ => true,
        }
    }

    fn drop_held(&mut self, peripheral: &PeripheralHandle) {
        self.held
            .retain(|held| held.peripheral.as_ref() != Some(peripheral));
    }
}

/// An in-memory [`NativeBinding`] with a single adapter.
pub struct SimulatedBinding {
    state: Mutex<State>,
}

impl Default for SimulatedBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedBinding")
            .field("adapter", &state.adapter)
            .field("scanning", &state.scanning)
            .field("peripherals", &state.peripherals.len())
            .finish_non_exhaustive()
    }
}

impl SimulatedBinding {
    pub fn new() -> Self {
        SimulatedBinding {
            state: Mutex::new(State {
                adapter: AdapterInfo {
                    handle: AdapterHandle::new(1),
                    identifier: "sim0".into(),
                    address: Some("00:00:5E:00:53:00".into()),
                    enabled: true,
                },
                delegate: None,
                scanning: false,
                scan_services: None,
                next_handle: 0x100,
                peripherals: Vec::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                holds: HashSet::new(),
                held: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adapter_delegate(&self) -> Option<Arc<dyn AdapterDelegate>> {
        self.lock().delegate.clone()
    }

    fn peripheral_delegate(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Option<Arc<dyn PeripheralDelegate>> {
        self.adapter_delegate()?.peripheral_delegate(peripheral)
    }

    /// Runs `completion` now, or queues it if `op` is held. Must be called without the
    /// state lock.
    fn complete(&self, op: Operation, peripheral: Option<PeripheralHandle>, completion: Completion) {
        {
            let mut state = self.lock();
            if state.holds.contains(&op) {
                debug!(?op, "holding completion");
                state.held.push(HeldCompletion {
                    peripheral,
                    completion,
                });
                return;
            }
        }
        completion(self);
    }

    fn complete_peripheral<F>(&self, op: Operation, peripheral: &PeripheralHandle, f: F)
    where
        F: FnOnce(&dyn PeripheralDelegate, PeripheralHandle) + Send + 'static,
    {
        let handle = peripheral.clone();
        self.complete(
            op,
            Some(peripheral.clone()),
            Box::new(move |sim: &SimulatedBinding| {
                if let Some(delegate) = sim.peripheral_delegate(&handle) {
                    f(&*delegate, handle);
                }
            }),
        );
    }

    /// Adds a peripheral. It is reported to every subsequent scan unless it is
    /// [`silent`][SimulatedPeripheral::silent].
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) -> PeripheralHandle {
        let mut state = self.lock();
        let handle = PeripheralHandle::new(state.alloc());
        let services = peripheral
            .services
            .into_iter()
            .map(|s| state.build_service(s))
            .collect();
        state.peripherals.push(PeripheralEntry {
            info: PeripheralInfo {
                handle: handle.clone(),
                id: peripheral.id,
                name: peripheral.name,
                rssi: peripheral.rssi,
                advertisement: peripheral.advertisement,
            },
            advertising: peripheral.advertising,
            connected: false,
            connecting: false,
            services,
        });
        handle
    }

    pub fn service_handle(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Option<ServiceHandle> {
        let state = self.lock();
        let entry = state.peripheral(peripheral).ok()?;
        entry
            .services
            .iter()
            .find(|s| s.uuid == service)
            .map(|s| s.handle.clone())
    }

    pub fn characteristic_handle(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<CharacteristicHandle> {
        let state = self.lock();
        let entry = state.peripheral(peripheral).ok()?;
        entry
            .services
            .iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == characteristic)
            .map(|c| c.handle.clone())
    }

    /// The current value of a characteristic in the peripheral's database.
    pub fn characteristic_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) -> Option<Vec<u8>> {
        let state = self.lock();
        let entry = state.peripheral(peripheral).ok()?;
        entry
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| &c.handle == characteristic)
            .map(|c| c.value.clone())
    }

    pub fn is_connected(&self, peripheral: &PeripheralHandle) -> bool {
        self.lock()
            .peripheral(peripheral)
            .is_ok_and(|entry| entry.connected)
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn is_notifying(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) -> bool {
        self.lock()
            .characteristic_mut(peripheral, characteristic)
            .is_ok_and(|c| c.notifying)
    }

    /// Every native call made so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Fails the next call of kind `op` with `error`. Failures queue up per kind.
    pub fn fail_next(&self, op: Operation, error: impl Into<Error>) {
        self.lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error.into());
    }

    /// Holds back the completions of every call of kind `op` until
    /// [`release_held()`][Self::release_held] is called.
    pub fn hold(&self, op: Operation) {
        self.lock().holds.insert(op);
    }

    /// Stops holding `op` without delivering completions already held.
    pub fn unhold(&self, op: Operation) {
        self.lock().holds.remove(&op);
    }

    /// Delivers every held completion in issue order and returns how many were delivered.
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut self.lock().held);
        let count = held.len();
        for held in held {
            (held.completion)(self);
        }
        count
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Reports an advertisement from `peripheral` if a scan is running. Returns `true` if
    /// the advertisement was delivered.
    pub fn advertise(&self, peripheral: &PeripheralHandle) -> bool {
        let (delegate, info) = {
            let mut state = self.lock();
            let scanning = state.scanning;
            let Ok(entry) = state.peripheral_mut(peripheral) else {
                return false;
            };
            entry.advertising = true;
            if !scanning {
                return false;
            }
            let info = entry.info.clone();
            (state.delegate.clone(), info)
        };

        match delegate {
            Some(delegate) => {
                delegate.did_discover(info);
                true
            }
            None => false,
        }
    }

    /// Pushes a notification if the peripheral is connected and subscribed. Returns
    /// `true` if it was delivered.
    pub fn notify(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        value: impl Into<Vec<u8>>,
    ) -> bool {
        let value = value.into();
        {
            let mut state = self.lock();
            match state.characteristic_mut(peripheral, characteristic) {
                Ok(entry) if entry.notifying => entry.value = value.clone(),
                _ => return false,
            }
        }

        match self.peripheral_delegate(peripheral) {
            Some(delegate) => {
                delegate.did_receive_notification(
                    peripheral.clone(),
                    characteristic.clone(),
                    value,
                );
                true
            }
            None => false,
        }
    }

    /// Simulates loss of the link to a connected peripheral.
    pub fn drop_link(&self, peripheral: &PeripheralHandle) {
        let delegate = {
            let mut state = self.lock();
            state.drop_held(peripheral);
            match state.peripheral_mut(peripheral) {
                Ok(entry) if entry.connected => {
                    entry.connected = false;
                    reset_notifications(entry);
                }
                _ => return,
            }
            state.delegate.clone()
        };

        if let Some(delegate) = delegate {
            delegate.did_disconnect(
                peripheral.clone(),
                Some(Error::native(
                    ErrorKind::PeripheralDisconnected,
                    0x08,
                    "connection timeout",
                )),
            );
        }
    }

    /// Adds a service to a peripheral's database and reports it as modified.
    pub fn add_service(&self, peripheral: &PeripheralHandle, service: SimulatedService) {
        let info = {
            let mut state = self.lock();
            let entry = state.build_service(service);
            let info = entry.info();
            let Ok(p) = state.peripheral_mut(peripheral) else {
                return;
            };
            p.services.push(entry);
            info
        };
        self.report_service_changes(peripheral, vec![info], Vec::new());
    }

    /// Replaces the characteristics of an existing service and reports it as modified.
    /// The service keeps its handle, its characteristics and descriptors get new ones.
    pub fn replace_service(&self, peripheral: &PeripheralHandle, service: SimulatedService) {
        let info = {
            let mut state = self.lock();
            let mut entry = state.build_service(service);
            let Ok(p) = state.peripheral_mut(peripheral) else {
                return;
            };
            let Some(existing) = p.services.iter_mut().find(|s| s.uuid == entry.uuid) else {
                return;
            };
            entry.handle = existing.handle.clone();
            *existing = entry;
            existing.info()
        };
        self.report_service_changes(peripheral, vec![info], Vec::new());
    }

    /// Removes a service from a peripheral's database and reports it as removed.
    pub fn remove_service(&self, peripheral: &PeripheralHandle, service: Uuid) {
        let removed = {
            let mut state = self.lock();
            let Ok(p) = state.peripheral_mut(peripheral) else {
                return;
            };
            let Some(index) = p.services.iter().position(|s| s.uuid == service) else {
                return;
            };
            p.services.remove(index).handle
        };
        self.report_service_changes(peripheral, Vec::new(), vec![removed]);
    }

    fn report_service_changes(
        &self,
        peripheral: &PeripheralHandle,
        modified: Vec<ServiceInfo>,
        removed: Vec<ServiceHandle>,
    ) {
        if !self.is_connected(peripheral) {
            return;
        }
        if let Some(delegate) = self.peripheral_delegate(peripheral) {
            delegate.did_modify_services(peripheral.clone(), modified, removed);
        }
    }

    /// Ends a running scan with a native error.
    pub fn fail_scan(&self, error: impl Into<Error>) {
        self.end_scan(Some(error.into()));
    }

    /// Ends a running scan without an error, as if the platform cancelled it.
    pub fn interrupt_scan(&self) {
        self.end_scan(None);
    }

    fn end_scan(&self, error: Option<Error>) {
        let delegate = {
            let mut state = self.lock();
            if !state.scanning {
                return;
            }
            state.scanning = false;
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.did_stop_scan(error);
        }
    }

    /// Powers the radio on or off. Powering off ends the scan and drops every link.
    pub fn set_enabled(&self, enabled: bool) {
        let (delegate, scanning, dropped) = {
            let mut state = self.lock();
            if state.adapter.enabled == enabled {
                return;
            }
            state.adapter.enabled = enabled;
            let mut scanning = false;
            let mut dropped = Vec::new();
            if !enabled {
                scanning = std::mem::take(&mut state.scanning);
                for entry in state.peripherals.iter_mut() {
                    if entry.connected || entry.connecting {
                        entry.connected = false;
                        entry.connecting = false;
                        reset_notifications(entry);
                        dropped.push(entry.info.handle.clone());
                    }
                }
                for handle in &dropped {
                    state.drop_held(handle);
                }
            }
            (state.delegate.clone(), scanning, dropped)
        };

        let Some(delegate) = delegate else {
            return;
        };
        if scanning {
            delegate.did_stop_scan(Some(ErrorKind::AdapterUnavailable.into()));
        }
        for peripheral in dropped {
            delegate.did_disconnect(peripheral, Some(ErrorKind::AdapterUnavailable.into()));
        }
        delegate.did_update_state(enabled);
    }

    fn finish_connect(&self, peripheral: &PeripheralHandle) {
        let delegate = {
            let mut state = self.lock();
            match state.peripheral_mut(peripheral) {
                Ok(entry) if entry.connecting => {
                    entry.connecting = false;
                    entry.connected = true;
                }
                _ => return,
            }
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.did_connect(peripheral.clone());
        }
    }
}

fn reset_notifications(entry: &mut PeripheralEntry) {
    for c in entry
        .services
        .iter_mut()
        .flat_map(|s| s.characteristics.iter_mut())
    {
        c.notifying = false;
    }
}

fn filter_uuids(filter: Option<&[Uuid]>) -> Option<Vec<Uuid>> {
    filter.map(<[Uuid]>::to_vec)
}

fn matches_filter(filter: &Option<Vec<Uuid>>, uuid: &Uuid) -> bool {
    filter.as_ref().is_none_or(|f| f.contains(uuid))
}

impl NativeBinding for SimulatedBinding {
    fn adapters(&self) -> Result<Vec<AdapterInfo>> {
        Ok(vec![self.lock().adapter.clone()])
    }

    fn set_delegate(&self, adapter: &AdapterHandle, delegate: Arc<dyn AdapterDelegate>) {
        let mut state = self.lock();
        if &state.adapter.handle == adapter {
            state.delegate = Some(delegate);
        }
    }

    fn is_enabled(&self, _adapter: &AdapterHandle) -> bool {
        self.lock().adapter.enabled
    }

    fn start_scan(&self, _adapter: &AdapterHandle, services: Option<&[Uuid]>) {
        let (delegate, reports) = {
            let mut state = self.lock();
            state.calls.push(Call::StartScan(filter_uuids(services)));
            debug!(?services, "start scan");

            let error = match state.take_failure(Operation::StartScan) {
                Some(error) => Some(error),
                None if !state.adapter.enabled => Some(ErrorKind::AdapterUnavailable.into()),
                None => None,
            };
            if let Some(error) = error {
                let delegate = state.delegate.clone();
                drop(state);
                if let Some(delegate) = delegate {
                    delegate.did_stop_scan(Some(error));
                }
                return;
            }

            state.scanning = true;
            state.scan_services = filter_uuids(services);
            let reports: Vec<_> = state
                .peripherals
                .iter()
                .filter(|p| p.advertising && state.scan_matches(p))
                .map(|p| p.info.clone())
                .collect();
            (state.delegate.clone(), reports)
        };

        let Some(delegate) = delegate else {
            return;
        };
        for info in reports {
            // The delegate may stop the scan from inside `did_discover`.
            if !self.is_scanning() {
                break;
            }
            delegate.did_discover(info);
        }
    }

    fn stop_scan(&self, _adapter: &AdapterHandle) {
        let mut state = self.lock();
        state.calls.push(Call::StopScan);
        state.scanning = false;
        state.scan_services = None;
    }

    fn connect(&self, _adapter: &AdapterHandle, peripheral: &PeripheralHandle) {
        let outcome = {
            let mut state = self.lock();
            state.calls.push(Call::Connect(peripheral.clone()));
            let enabled = state.adapter.enabled;
            match state.take_failure(Operation::Connect) {
                Some(error) => Err(error),
                None if !enabled => Err(ErrorKind::AdapterUnavailable.into()),
                None => state.peripheral_mut(peripheral).map(|entry| {
                    if !entry.connected {
                        entry.connecting = true;
                    }
                }),
            }
        };

        let handle = peripheral.clone();
        let completion: Completion = match outcome {
            Ok(()) => Box::new(move |sim: &SimulatedBinding| sim.finish_connect(&handle)),
            Err(error) => Box::new(move |sim: &SimulatedBinding| {
                if let Some(delegate) = sim.adapter_delegate() {
                    delegate.did_fail_to_connect(handle, error);
                }
            }),
        };
        self.complete(Operation::Connect, Some(peripheral.clone()), completion);
    }

    fn disconnect(&self, _adapter: &AdapterHandle, peripheral: &PeripheralHandle) {
        let delegate = {
            let mut state = self.lock();
            state.calls.push(Call::Disconnect(peripheral.clone()));
            state.drop_held(peripheral);
            if let Ok(entry) = state.peripheral_mut(peripheral) {
                entry.connected = false;
                entry.connecting = false;
                reset_notifications(entry);
            }
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.did_disconnect(peripheral.clone(), None);
        }
    }

    fn discover_services(&self, peripheral: &PeripheralHandle, services: Option<&[Uuid]>) {
        let filter = filter_uuids(services);
        let result = {
            let mut state = self.lock();
            state
                .calls
                .push(Call::DiscoverServices(peripheral.clone(), filter.clone()));
            match state.take_failure(Operation::DiscoverServices) {
                Some(error) => Err(error),
                None => state.connected(peripheral).map(|entry| {
                    entry
                        .services
                        .iter()
                        .filter(|s| s.is_primary && matches_filter(&filter, &s.uuid))
                        .map(ServiceEntry::info)
                        .collect::<Vec<_>>()
                }),
            }
        };
        self.complete_peripheral(Operation::DiscoverServices, peripheral, move |d, p| {
            d.did_discover_services(p, result)
        });
    }

    fn discover_included_services(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        services: Option<&[Uuid]>,
    ) {
        let filter = filter_uuids(services);
        let result = {
            let mut state = self.lock();
            state
                .calls
                .push(Call::DiscoverIncludedServices(service.clone()));
            match state.take_failure(Operation::DiscoverIncludedServices) {
                Some(error) => Err(error),
                None => state.connected(peripheral).and_then(|entry| {
                    let parent = entry
                        .services
                        .iter()
                        .find(|s| &s.handle == service)
                        .ok_or(Error::from(ErrorKind::InvalidHandle))?;
                    Ok(entry
                        .services
                        .iter()
                        .filter(|s| {
                            parent.includes.contains(&s.uuid) && matches_filter(&filter, &s.uuid)
                        })
                        .map(ServiceEntry::info)
                        .collect::<Vec<_>>())
                }),
            }
        };
        let service = service.clone();
        self.complete_peripheral(
            Operation::DiscoverIncludedServices,
            peripheral,
            move |d, p| d.did_discover_included_services(p, service, result),
        );
    }

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        characteristics: Option<&[Uuid]>,
    ) {
        let filter = filter_uuids(characteristics);
        let result = {
            let mut state = self.lock();
            state.calls.push(Call::DiscoverCharacteristics(
                service.clone(),
                filter.clone(),
            ));
            match state.take_failure(Operation::DiscoverCharacteristics) {
                Some(error) => Err(error),
                None => state.connected(peripheral).and_then(|entry| {
                    let service = entry
                        .services
                        .iter()
                        .find(|s| &s.handle == service)
                        .ok_or(Error::from(ErrorKind::InvalidHandle))?;
                    Ok(service
                        .characteristics
                        .iter()
                        .filter(|c| matches_filter(&filter, &c.uuid))
                        .map(CharacteristicEntry::info)
                        .collect::<Vec<_>>())
                }),
            }
        };
        let service = service.clone();
        self.complete_peripheral(
            Operation::DiscoverCharacteristics,
            peripheral,
            move |d, p| d.did_discover_characteristics(p, service, result),
        );
    }

    fn discover_descriptors(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) {
        let result = {
            let mut state = self.lock();
            state
                .calls
                .push(Call::DiscoverDescriptors(characteristic.clone()));
            match state.take_failure(Operation::DiscoverDescriptors) {
                Some(error) => Err(error),
                None => state
                    .characteristic_mut(peripheral, characteristic)
                    .map(|c| {
                        c.descriptors
                            .iter()
                            .map(|d| DescriptorInfo {
                                handle: d.handle.clone(),
                                uuid: d.uuid,
                            })
                            .collect::<Vec<_>>()
                    }),
            }
        };
        let characteristic = characteristic.clone();
        self.complete_peripheral(Operation::DiscoverDescriptors, peripheral, move |d, p| {
            d.did_discover_descriptors(p, characteristic, result)
        });
    }

    fn read_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) {
        let result = {
            let mut state = self.lock();
            state
                .calls
                .push(Call::ReadCharacteristic(characteristic.clone()));
            match state.take_failure(Operation::ReadCharacteristic) {
                Some(error) => Err(error),
                None => state
                    .characteristic_mut(peripheral, characteristic)
                    .and_then(|c| {
                        if c.properties.read {
                            Ok(c.value.clone())
                        } else {
                            Err(AttError::READ_NOT_PERMITTED.into())
                        }
                    }),
            }
        };
        let characteristic = characteristic.clone();
        self.complete_peripheral(Operation::ReadCharacteristic, peripheral, move |d, p| {
            d.did_read_characteristic(p, characteristic, result)
        });
    }

    fn write_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        write_type: WriteType,
    ) {
        let result = {
            let mut state = self.lock();
            state.calls.push(Call::WriteCharacteristic(
                characteristic.clone(),
                data.to_vec(),
                write_type,
            ));
            match state.take_failure(Operation::WriteCharacteristic) {
                Some(error) => Err(error),
                None => state
                    .characteristic_mut(peripheral, characteristic)
                    .and_then(|c| {
                        let permitted = match write_type {
                            WriteType::WithResponse => c.properties.write,
                            WriteType::WithoutResponse => c.properties.write_without_response,
                        };
                        if permitted {
                            c.value = data.to_vec();
                            Ok(())
                        } else {
                            Err(AttError::WRITE_NOT_PERMITTED.into())
                        }
                    }),
            }
        };
        let characteristic = characteristic.clone();
        self.complete_peripheral(Operation::WriteCharacteristic, peripheral, move |d, p| {
            d.did_write_characteristic(p, characteristic, result)
        });
    }

    fn set_notify(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) {
        let result = {
            let mut state = self.lock();
            state
                .calls
                .push(Call::SetNotify(characteristic.clone(), enabled));
            match state.take_failure(Operation::SetNotify) {
                Some(error) => Err(error),
                None => state
                    .characteristic_mut(peripheral, characteristic)
                    .and_then(|c| {
                        if c.properties.can_notify() {
                            c.notifying = enabled;
                            Ok(enabled)
                        } else {
                            Err(AttError::REQUEST_NOT_SUPPORTED.into())
                        }
                    }),
            }
        };
        let characteristic = characteristic.clone();
        self.complete_peripheral(Operation::SetNotify, peripheral, move |d, p| {
            d.did_update_notification_state(p, characteristic, result)
        });
    }

    fn read_descriptor(&self, peripheral: &PeripheralHandle, descriptor: &DescriptorHandle) {
        let result = {
            let mut state = self.lock();
            state.calls.push(Call::ReadDescriptor(descriptor.clone()));
            match state.take_failure(Operation::ReadDescriptor) {
                Some(error) => Err(error),
                None => state
                    .descriptor_mut(peripheral, descriptor)
                    .map(|d| d.value.clone()),
            }
        };
        let descriptor = descriptor.clone();
        self.complete_peripheral(Operation::ReadDescriptor, peripheral, move |d, p| {
            d.did_read_descriptor(p, descriptor, result)
        });
    }

    fn write_descriptor(
        &self,
        peripheral: &PeripheralHandle,
        descriptor: &DescriptorHandle,
        data: &[u8],
    ) {
        let result = {
            let mut state = self.lock();
            state
                .calls
                .push(Call::WriteDescriptor(descriptor.clone(), data.to_vec()));
            match state.take_failure(Operation::WriteDescriptor) {
                Some(error) => Err(error),
                None => state.descriptor_mut(peripheral, descriptor).map(|d| {
                    d.value = data.to_vec();
                }),
            }
        };
        let descriptor = descriptor.clone();
        self.complete_peripheral(Operation::WriteDescriptor, peripheral, move |d, p| {
            d.did_write_descriptor(p, descriptor, result)
        });
    }

    fn release(&self, handle: &NativeHandle) {
        debug!(%handle, "release");
        self.lock().calls.push(Call::Release(handle.clone()));
    }
}
