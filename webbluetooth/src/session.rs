//! The GATT session of a device.
//!
//! A session tracks the connection state of one device and owns the service tree
//! discovered over the current connection. Public GATT objects only hold the registry id of
//! their node and the connection generation it was discovered in. Every operation checks
//! both before touching the native layer, so an object from a previous connection fails
//! with a network error instead of reaching a released handle.
//!
//! Operations on one session are serialized in issue order. Connecting and disconnecting
//! are not, so that a disconnect can abort whatever is in flight.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_channel::oneshot;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use webbluetooth_binding::{
    CharacteristicHandle, CharacteristicInfo, CharacteristicProperties, DescriptorHandle,
    DescriptorInfo, NativeHandle, ServiceHandle, ServiceInfo, WriteType,
};

use crate::characteristic::Characteristic;
use crate::descriptor::Descriptor;
use crate::device::{BluetoothDevice, DeviceInner};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{
    CharacteristicEvent, DeviceEvent, EventTarget, ServerEvent, ServiceEvent, ValueChanged,
};
use crate::peripheral::PeripheralObserver;
use crate::registry::{HandleId, HandleMeta};
use crate::service::Service;
use crate::util::{defer, lock};

type Waiter = oneshot::Sender<Result<()>>;

#[derive(Default)]
pub(crate) struct Session {
    state: Mutex<SessionState>,
    op_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn is_connected(&self) -> bool {
        matches!(lock(&self.state).connection, Connection::Connected)
    }

    /// Forgets the connection and the service tree. Returns whether a link existed and the
    /// ids of every node.
    pub fn reset(&self) -> (bool, Vec<HandleId>) {
        let mut state = lock(&self.state);
        let linked = !matches!(state.connection, Connection::Disconnected);
        state.connection = Connection::Disconnected;
        (linked, state.tree.clear())
    }
}

#[derive(Default)]
struct SessionState {
    connection: Connection,
    /// Incremented on every successful connection.
    generation: u64,
    tree: Tree,
}

impl SessionState {
    fn current_generation(&self) -> Result<u64> {
        match self.connection {
            Connection::Connected => Ok(self.generation),
            _ => Err(Error::new(
                ErrorKind::Network,
                "the GATT server is disconnected",
            )),
        }
    }

    fn check(&self, generation: u64) -> Result<()> {
        if self.current_generation()? != generation {
            return Err(Error::new(
                ErrorKind::Network,
                "the attribute belongs to a previous connection",
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
enum Connection {
    #[default]
    Disconnected,
    Connecting(Vec<Waiter>),
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Default)]
enum Discovery {
    #[default]
    Undiscovered,
    Discovering,
    Discovered(Vec<HandleId>),
}

impl Discovery {
    fn ids(&self) -> &[HandleId] {
        match self {
            Discovery::Discovered(ids) => ids,
            _ => &[],
        }
    }
}

/// A memoized child list of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Services,
    Included(HandleId),
    Characteristics(HandleId),
    Descriptors(HandleId),
}

#[derive(Default)]
struct Tree {
    services: Discovery,
    nodes: HashMap<HandleId, Node>,
}

enum Node {
    Service(ServiceNode),
    Characteristic(CharacteristicNode),
    Descriptor(DescriptorNode),
}

struct ServiceNode {
    uuid: Uuid,
    is_primary: bool,
    included: Discovery,
    characteristics: Discovery,
    events: Arc<EventTarget<ServiceEvent>>,
}

struct CharacteristicNode {
    service: HandleId,
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Option<Vec<u8>>,
    /// The cached value was produced by a local write and has not been refreshed since.
    written: bool,
    notifying: bool,
    descriptors: Discovery,
    events: Arc<EventTarget<CharacteristicEvent>>,
}

struct DescriptorNode {
    uuid: Uuid,
    value: Option<Vec<u8>>,
    written: bool,
}

fn missing(id: HandleId) -> Error {
    Error::new(
        ErrorKind::InvalidState,
        format!("attribute {id} no longer exists"),
    )
}

impl Tree {
    fn slot_mut(&mut self, slot: Slot) -> Result<&mut Discovery> {
        match slot {
            Slot::Services => Ok(&mut self.services),
            Slot::Included(id) => self.service_mut(id).map(|s| &mut s.included),
            Slot::Characteristics(id) => self.service_mut(id).map(|s| &mut s.characteristics),
            Slot::Descriptors(id) => self.characteristic_mut(id).map(|c| &mut c.descriptors),
        }
    }

    fn service(&self, id: HandleId) -> Result<&ServiceNode> {
        match self.nodes.get(&id) {
            Some(Node::Service(node)) => Ok(node),
            _ => Err(missing(id)),
        }
    }

    fn service_mut(&mut self, id: HandleId) -> Result<&mut ServiceNode> {
        match self.nodes.get_mut(&id) {
            Some(Node::Service(node)) => Ok(node),
            _ => Err(missing(id)),
        }
    }

    fn characteristic(&self, id: HandleId) -> Result<&CharacteristicNode> {
        match self.nodes.get(&id) {
            Some(Node::Characteristic(node)) => Ok(node),
            _ => Err(missing(id)),
        }
    }

    fn characteristic_mut(&mut self, id: HandleId) -> Result<&mut CharacteristicNode> {
        match self.nodes.get_mut(&id) {
            Some(Node::Characteristic(node)) => Ok(node),
            _ => Err(missing(id)),
        }
    }

    fn descriptor(&self, id: HandleId) -> Result<&DescriptorNode> {
        match self.nodes.get(&id) {
            Some(Node::Descriptor(node)) => Ok(node),
            _ => Err(missing(id)),
        }
    }

    fn descriptor_mut(&mut self, id: HandleId) -> Result<&mut DescriptorNode> {
        match self.nodes.get_mut(&id) {
            Some(Node::Descriptor(node)) => Ok(node),
            _ => Err(missing(id)),
        }
    }

    /// Drops every node and returns their ids.
    fn clear(&mut self) -> Vec<HandleId> {
        self.services = Discovery::Undiscovered;
        self.nodes.drain().map(|(id, _)| id).collect()
    }

    /// Forgets the characteristics and included services of a service. Returns the ids of
    /// the removed characteristics and descriptors.
    fn clear_children(&mut self, service: HandleId) -> Vec<HandleId> {
        let Ok(node) = self.service_mut(service) else {
            return Vec::new();
        };
        node.included = Discovery::Undiscovered;
        let characteristics = std::mem::take(&mut node.characteristics);

        let mut removed = Vec::new();
        for id in characteristics.ids() {
            if let Some(Node::Characteristic(c)) = self.nodes.remove(id) {
                for descriptor in c.descriptors.ids() {
                    if self.nodes.remove(descriptor).is_some() {
                        removed.push(*descriptor);
                    }
                }
                removed.push(*id);
            }
        }
        removed
    }
}

/// A discovered attribute that becomes a node of the tree.
trait ChildInfo {
    fn native(&self) -> NativeHandle;

    fn meta(&self, device_id: &str) -> HandleMeta;

    fn into_node(self, parent: HandleId) -> Node;
}

impl ChildInfo for ServiceInfo {
    fn native(&self) -> NativeHandle {
        self.handle.as_native().clone()
    }

    fn meta(&self, device_id: &str) -> HandleMeta {
        HandleMeta::Service {
            device_id: device_id.to_owned(),
            uuid: self.uuid,
        }
    }

    fn into_node(self, _parent: HandleId) -> Node {
        Node::Service(ServiceNode {
            uuid: self.uuid,
            is_primary: self.is_primary,
            included: Discovery::Undiscovered,
            characteristics: Discovery::Undiscovered,
            events: Arc::new(EventTarget::new()),
        })
    }
}

impl ChildInfo for CharacteristicInfo {
    fn native(&self) -> NativeHandle {
        self.handle.as_native().clone()
    }

    fn meta(&self, device_id: &str) -> HandleMeta {
        HandleMeta::Characteristic {
            device_id: device_id.to_owned(),
            uuid: self.uuid,
        }
    }

    fn into_node(self, parent: HandleId) -> Node {
        Node::Characteristic(CharacteristicNode {
            service: parent,
            uuid: self.uuid,
            properties: self.properties,
            value: None,
            written: false,
            notifying: false,
            descriptors: Discovery::Undiscovered,
            events: Arc::new(EventTarget::new()),
        })
    }
}

impl ChildInfo for DescriptorInfo {
    fn native(&self) -> NativeHandle {
        self.handle.as_native().clone()
    }

    fn meta(&self, device_id: &str) -> HandleMeta {
        HandleMeta::Descriptor {
            device_id: device_id.to_owned(),
            uuid: self.uuid,
        }
    }

    fn into_node(self, _parent: HandleId) -> Node {
        Node::Descriptor(DescriptorNode {
            uuid: self.uuid,
            value: None,
            written: false,
        })
    }
}

/// How many of the matching children a lookup wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Select {
    One(Uuid),
    All(Option<Uuid>),
}

impl Select {
    fn uuid(self) -> Option<Uuid> {
        match self {
            Select::One(uuid) => Some(uuid),
            Select::All(uuid) => uuid,
        }
    }

    fn finish<T>(self, found: Vec<T>, kind: &str) -> Result<Vec<T>> {
        match self.uuid() {
            Some(uuid) if found.is_empty() => Err(Error::new(
                ErrorKind::NotFound,
                format!("no {kind} matching {uuid}"),
            )),
            _ => match self {
                Select::One(_) => Ok(found.into_iter().take(1).collect()),
                Select::All(_) => Ok(found),
            },
        }
    }
}

impl DeviceInner {
    fn device(self: &Arc<Self>) -> BluetoothDevice {
        BluetoothDevice {
            inner: self.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Connects, or joins the connection attempt already in flight.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (receiver, issue) = {
            let mut state = lock(&self.session.state);
            match &mut state.connection {
                Connection::Connected => return Ok(()),
                Connection::Disconnecting => {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        "the GATT server is disconnecting",
                    ));
                }
                Connection::Connecting(waiters) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    (receiver, false)
                }
                Connection::Disconnected => {
                    let (sender, receiver) = oneshot::channel();
                    state.connection = Connection::Connecting(vec![sender]);
                    (receiver, true)
                }
            }
        };

        if issue {
            info!(device = %self.id(), "connecting");
            if let Err(err) = self.peripheral.connect() {
                self.fail_connect(err);
            }
        } else {
            debug!(device = %self.id(), "joining connection attempt");
        }
        receiver.await?
    }

    fn fail_connect(&self, error: Error) {
        let waiters = {
            let mut state = lock(&self.session.state);
            match std::mem::take(&mut state.connection) {
                Connection::Connecting(waiters) => waiters,
                other => {
                    state.connection = other;
                    return;
                }
            }
        };
        warn!(device = %self.id(), "connection failed: {error}");
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Disconnects. Aborts a connection attempt in flight. Does nothing if disconnected.
    pub fn disconnect(&self) {
        let aborted = {
            let mut state = lock(&self.session.state);
            match std::mem::take(&mut state.connection) {
                Connection::Connecting(waiters) => Some(waiters),
                Connection::Connected => {
                    state.connection = Connection::Disconnecting;
                    None
                }
                other => {
                    state.connection = other;
                    return;
                }
            }
        };

        match aborted {
            Some(waiters) => {
                info!(device = %self.id(), "aborting connection attempt");
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::new(
                        ErrorKind::Network,
                        "the connection attempt was aborted by a disconnect",
                    )));
                }
            }
            None => {
                info!(device = %self.id(), "disconnecting");
                self.peripheral.cancel_pending();
            }
        }
        self.peripheral.disconnect();
    }

    /// Ends the current connection: drops the tree, releases its handles and notifies
    /// listeners.
    fn link_down(self: &Arc<Self>, error: Option<Error>) {
        let (waiters, was_connected, ids) = {
            let mut state = lock(&self.session.state);
            match std::mem::take(&mut state.connection) {
                Connection::Disconnected => return,
                Connection::Connecting(waiters) => (waiters, false, Vec::new()),
                Connection::Connected | Connection::Disconnecting => {
                    (Vec::new(), true, state.tree.clear())
                }
            }
        };

        self.peripheral.cancel_pending();
        if !ids.is_empty() {
            debug!(device = %self.id(), handles = ids.len(), "releasing GATT handles");
            self.adapter().release_many(ids);
        }

        if !waiters.is_empty() {
            let error = error.clone().unwrap_or_else(|| {
                Error::new(ErrorKind::Network, "the connection attempt was aborted")
            });
            warn!(device = %self.id(), "connection failed: {error}");
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }

        if was_connected {
            match &error {
                Some(error) => warn!(device = %self.id(), "connection lost: {error}"),
                None => info!(device = %self.id(), "disconnected"),
            }
            self.dispatch_device_event(DeviceEvent::GattServerDisconnected {
                device_id: self.id().to_owned(),
            });
        }
    }

    /// Runs `fetch` the first time `slot` is needed in this connection and memoizes the
    /// result. Returns the ids of the children and the ids of the nodes it created.
    async fn children<I, F>(
        &self,
        slot: Slot,
        generation: u64,
        fetch: F,
    ) -> Result<(Vec<HandleId>, Vec<HandleId>)>
    where
        I: ChildInfo,
        F: Future<Output = Result<Vec<I>>>,
    {
        {
            let mut state = lock(&self.session.state);
            state.check(generation)?;
            let discovery = state.tree.slot_mut(slot)?;
            if let Discovery::Discovered(ids) = discovery {
                return Ok((ids.clone(), Vec::new()));
            }
            *discovery = Discovery::Discovering;
        }

        // Let the next lookup retry if discovery fails or this future is dropped.
        let guard = defer(|| {
            let mut state = lock(&self.session.state);
            if state.check(generation).is_err() {
                return;
            }
            if let Ok(discovery) = state.tree.slot_mut(slot) {
                if matches!(discovery, Discovery::Discovering) {
                    *discovery = Discovery::Undiscovered;
                }
            }
        });

        debug!(device = %self.id(), ?slot, "discovering");
        let infos = fetch.await?;
        guard.defuse();

        let adapter = self.adapter();
        let registered: Vec<_> = infos
            .into_iter()
            .map(|info| {
                let (id, new) = adapter.register(info.native(), info.meta(self.id()));
                (id, new, info)
            })
            .collect();

        let mut state = lock(&self.session.state);
        let current = state
            .check(generation)
            .and_then(|()| state.tree.slot_mut(slot).map(|_| ()));
        if let Err(err) = current {
            drop(state);
            adapter.release_many(
                registered
                    .iter()
                    .filter(|(_, new, _)| *new)
                    .map(|(id, _, _)| *id),
            );
            return Err(err);
        }

        let parent = match slot {
            Slot::Services | Slot::Included(_) => self.peripheral_id,
            Slot::Characteristics(id) | Slot::Descriptors(id) => id,
        };
        let mut ids = Vec::with_capacity(registered.len());
        let mut inserted = Vec::new();
        for (id, _, info) in registered {
            if !ids.contains(&id) {
                ids.push(id);
            }
            if let Entry::Vacant(entry) = state.tree.nodes.entry(id) {
                entry.insert(info.into_node(parent));
                inserted.push(id);
            }
        }
        if let Ok(discovery) = state.tree.slot_mut(slot) {
            *discovery = Discovery::Discovered(ids.clone());
        }
        Ok((ids, inserted))
    }

    fn service_object(self: &Arc<Self>, state: &SessionState, id: HandleId) -> Option<Service> {
        let node = state.tree.service(id).ok()?;
        Some(Service::new(
            self.device(),
            id,
            state.generation,
            node.uuid,
            node.is_primary,
            node.events.clone(),
        ))
    }

    fn characteristic_object(
        self: &Arc<Self>,
        state: &SessionState,
        id: HandleId,
    ) -> Option<Characteristic> {
        let node = state.tree.characteristic(id).ok()?;
        let service = self.service_object(state, node.service)?;
        Some(Characteristic::new(
            service,
            id,
            node.uuid,
            node.properties,
            node.events.clone(),
        ))
    }

    fn is_allowed(&self, uuid: &Uuid) -> bool {
        let allowed = self.allowed_services();
        allowed.is_empty() || allowed.contains(uuid)
    }

    fn check_allowed(&self, uuid: &Uuid) -> Result<()> {
        if self.is_allowed(uuid) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::Security,
                format!("access to service {uuid} was not requested"),
            ))
        }
    }

    pub async fn primary_services(self: &Arc<Self>, select: Select) -> Result<Vec<Service>> {
        let _op = self.session.op_lock.lock().await;
        let generation = lock(&self.session.state).current_generation()?;
        if let Some(uuid) = select.uuid() {
            self.check_allowed(&uuid)?;
        }

        let allowed: Vec<_> = self.allowed_services().into_iter().collect();
        let filter = (!allowed.is_empty()).then_some(allowed.as_slice());
        let (ids, inserted) = self
            .children(
                Slot::Services,
                generation,
                self.peripheral.discover_services(filter),
            )
            .await?;

        let (found, added) = {
            let state = lock(&self.session.state);
            let found: Vec<_> = ids
                .iter()
                .filter_map(|id| self.service_object(&state, *id))
                .filter(|s| s.is_primary() && self.is_allowed(&s.uuid()))
                .filter(|s| select.uuid().is_none_or(|uuid| s.uuid() == uuid))
                .collect();
            let added: Vec<_> = inserted
                .iter()
                .filter_map(|id| self.service_object(&state, *id))
                .collect();
            (found, added)
        };
        for service in added {
            self.dispatch_server_event(ServerEvent::ServiceAdded(service));
        }
        select.finish(found, "service")
    }

    pub async fn included_services(
        self: &Arc<Self>,
        service: &Service,
        select: Select,
    ) -> Result<Vec<Service>> {
        let _op = self.session.op_lock.lock().await;
        let handle = self.resolve::<ServiceHandle>(service.id(), service.generation())?;
        let (ids, _) = self
            .children(
                Slot::Included(service.id()),
                service.generation(),
                self.peripheral.discover_included_services(&handle),
            )
            .await?;

        let state = lock(&self.session.state);
        let found: Vec<_> = ids
            .iter()
            .filter_map(|id| self.service_object(&state, *id))
            .filter(|s| self.is_allowed(&s.uuid()))
            .filter(|s| select.uuid().is_none_or(|uuid| s.uuid() == uuid))
            .collect();
        drop(state);
        select.finish(found, "included service")
    }

    pub async fn characteristics(
        self: &Arc<Self>,
        service: &Service,
        select: Select,
    ) -> Result<Vec<Characteristic>> {
        let _op = self.session.op_lock.lock().await;
        let handle = self.resolve::<ServiceHandle>(service.id(), service.generation())?;
        let (ids, _) = self
            .children(
                Slot::Characteristics(service.id()),
                service.generation(),
                self.peripheral.discover_characteristics(&handle),
            )
            .await?;

        let state = lock(&self.session.state);
        let found: Vec<_> = ids
            .iter()
            .filter_map(|id| self.characteristic_object(&state, *id))
            .filter(|c| select.uuid().is_none_or(|uuid| c.uuid() == uuid))
            .collect();
        drop(state);
        select.finish(found, "characteristic")
    }

    pub async fn descriptors(
        self: &Arc<Self>,
        characteristic: &Characteristic,
        select: Select,
    ) -> Result<Vec<Descriptor>> {
        let _op = self.session.op_lock.lock().await;
        let generation = characteristic.service().generation();
        let handle = self.resolve::<CharacteristicHandle>(characteristic.id(), generation)?;
        let (ids, _) = self
            .children(
                Slot::Descriptors(characteristic.id()),
                generation,
                self.peripheral.discover_descriptors(&handle),
            )
            .await?;

        let state = lock(&self.session.state);
        let found: Vec<_> = ids
            .iter()
            .filter_map(|id| {
                let node = state.tree.descriptor(*id).ok()?;
                Some(Descriptor::new(characteristic.clone(), *id, node.uuid))
            })
            .filter(|d| select.uuid().is_none_or(|uuid| d.uuid() == uuid))
            .collect();
        drop(state);
        select.finish(found, "descriptor")
    }

    /// Checks that the node `id` is current and returns its native handle.
    fn resolve<H: From<NativeHandle>>(&self, id: HandleId, generation: u64) -> Result<H> {
        {
            let state = lock(&self.session.state);
            state.check(generation)?;
            if !state.tree.nodes.contains_key(&id) {
                return Err(missing(id));
            }
        }
        self.adapter().lookup(id).map(H::from)
    }

    fn check_length(&self, value: &[u8]) -> Result<()> {
        let max = self.adapter().options.max_value_length;
        if value.len() > max {
            return Err(Error::new(
                ErrorKind::InvalidModification,
                format!("value of {} bytes exceeds the maximum of {max}", value.len()),
            ));
        }
        Ok(())
    }

    fn dispatch_value_changed(&self, characteristic: Characteristic, value: Vec<u8>) {
        let event = ValueChanged {
            characteristic,
            value,
        };
        event
            .characteristic
            .events()
            .dispatch(&CharacteristicEvent::CharacteristicValueChanged(event.clone()));
        event
            .characteristic
            .service()
            .events()
            .dispatch(&ServiceEvent::CharacteristicValueChanged(event.clone()));
        self.dispatch_device_event(DeviceEvent::CharacteristicValueChanged(event));
    }

    fn dispatch_device_event(&self, event: DeviceEvent) {
        self.events.dispatch(&event);
        self.bluetooth_events.dispatch(&event.into());
    }

    fn dispatch_server_event(&self, event: ServerEvent) {
        let (ServerEvent::ServiceAdded(service)
        | ServerEvent::ServiceChanged(service)
        | ServerEvent::ServiceRemoved(service)) = &event;
        service.events().dispatch(&event.clone().into());
        self.server_events.dispatch(&event);
        self.bluetooth_events.dispatch(&event.into());
    }

    pub async fn read_characteristic(
        self: &Arc<Self>,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>> {
        let _op = self.session.op_lock.lock().await;
        let id = characteristic.id();
        let generation = characteristic.service().generation();
        {
            let state = lock(&self.session.state);
            state.check(generation)?;
            let node = state.tree.characteristic(id)?;
            if !node.properties.read {
                return Err(Error::new(
                    ErrorKind::NotSupported,
                    "the characteristic does not support reads",
                ));
            }
            if let (true, Some(value)) = (node.written, &node.value) {
                trace!(device = %self.id(), characteristic = %id, "read from cache");
                return Ok(value.clone());
            }
        }

        let handle = self.resolve::<CharacteristicHandle>(id, generation)?;
        let value = self.peripheral.read_characteristic(&handle).await?;
        {
            let mut state = lock(&self.session.state);
            state.check(generation)?;
            if let Ok(node) = state.tree.characteristic_mut(id) {
                node.value = Some(value.clone());
                node.written = false;
            }
        }
        self.dispatch_value_changed(characteristic.clone(), value.clone());
        Ok(value)
    }

    /// Writes a characteristic. `None` picks a write with response when the
    /// characteristic supports it.
    pub async fn write_characteristic(
        self: &Arc<Self>,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: Option<WriteType>,
    ) -> Result<()> {
        let _op = self.session.op_lock.lock().await;
        let id = characteristic.id();
        let generation = characteristic.service().generation();
        let write_type = {
            let state = lock(&self.session.state);
            state.check(generation)?;
            let properties = state.tree.characteristic(id)?.properties;
            self.check_length(value)?;
            match write_type {
                Some(WriteType::WithResponse) if properties.write => WriteType::WithResponse,
                Some(WriteType::WithoutResponse) if properties.write_without_response => {
                    WriteType::WithoutResponse
                }
                None if properties.write => WriteType::WithResponse,
                None if properties.write_without_response => WriteType::WithoutResponse,
                _ => {
                    return Err(Error::new(
                        ErrorKind::NotSupported,
                        "the characteristic does not support this kind of write",
                    ));
                }
            }
        };

        let handle = self.resolve::<CharacteristicHandle>(id, generation)?;
        self.peripheral
            .write_characteristic(&handle, value, write_type)
            .await?;

        let mut state = lock(&self.session.state);
        state.check(generation)?;
        if let Ok(node) = state.tree.characteristic_mut(id) {
            node.value = Some(value.to_vec());
            node.written = true;
        }
        Ok(())
    }

    pub async fn set_notifications(
        self: &Arc<Self>,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<()> {
        let _op = self.session.op_lock.lock().await;
        let id = characteristic.id();
        let generation = characteristic.service().generation();
        {
            let state = lock(&self.session.state);
            state.check(generation)?;
            let node = state.tree.characteristic(id)?;
            if !node.properties.can_notify() {
                return Err(Error::new(
                    ErrorKind::NotSupported,
                    "the characteristic supports neither notifications nor indications",
                ));
            }
            if node.notifying == enabled {
                return Ok(());
            }
        }

        let handle = self.resolve::<CharacteristicHandle>(id, generation)?;
        let notifying = self.peripheral.set_notify(&handle, enabled).await?;
        debug!(device = %self.id(), characteristic = %id, notifying, "notification state");

        let mut state = lock(&self.session.state);
        state.check(generation)?;
        if let Ok(node) = state.tree.characteristic_mut(id) {
            node.notifying = notifying;
        }
        Ok(())
    }

    /// The cached value and notification state of a characteristic.
    pub fn characteristic_state(
        &self,
        characteristic: &Characteristic,
    ) -> (Option<Vec<u8>>, bool) {
        let state = lock(&self.session.state);
        let generation = characteristic.service().generation();
        match state.check(generation) {
            Ok(()) => state
                .tree
                .characteristic(characteristic.id())
                .map(|node| (node.value.clone(), node.notifying))
                .unwrap_or_default(),
            Err(_) => (None, false),
        }
    }

    pub async fn read_descriptor(self: &Arc<Self>, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let _op = self.session.op_lock.lock().await;
        let id = descriptor.id();
        let generation = descriptor.characteristic().service().generation();
        {
            let state = lock(&self.session.state);
            state.check(generation)?;
            let node = state.tree.descriptor(id)?;
            if let (true, Some(value)) = (node.written, &node.value) {
                return Ok(value.clone());
            }
        }

        let handle = self.resolve::<DescriptorHandle>(id, generation)?;
        let value = self.peripheral.read_descriptor(&handle).await?;

        let mut state = lock(&self.session.state);
        state.check(generation)?;
        if let Ok(node) = state.tree.descriptor_mut(id) {
            node.value = Some(value.clone());
            node.written = false;
        }
        Ok(value)
    }

    pub async fn write_descriptor(
        self: &Arc<Self>,
        descriptor: &Descriptor,
        value: &[u8],
    ) -> Result<()> {
        let _op = self.session.op_lock.lock().await;
        let id = descriptor.id();
        let generation = descriptor.characteristic().service().generation();
        {
            let state = lock(&self.session.state);
            state.check(generation)?;
            state.tree.descriptor(id)?;
            self.check_length(value)?;
        }

        let handle = self.resolve::<DescriptorHandle>(id, generation)?;
        self.peripheral.write_descriptor(&handle, value).await?;

        let mut state = lock(&self.session.state);
        state.check(generation)?;
        if let Ok(node) = state.tree.descriptor_mut(id) {
            node.value = Some(value.to_vec());
            node.written = true;
        }
        Ok(())
    }

    pub fn descriptor_value(&self, descriptor: &Descriptor) -> Option<Vec<u8>> {
        let state = lock(&self.session.state);
        let generation = descriptor.characteristic().service().generation();
        state.check(generation).ok()?;
        state.tree.descriptor(descriptor.id()).ok()?.value.clone()
    }
}

impl PeripheralObserver for DeviceInner {
    fn did_connect(self: Arc<Self>) {
        let waiters = {
            let mut state = lock(&self.session.state);
            match std::mem::take(&mut state.connection) {
                Connection::Connecting(waiters) => {
                    state.connection = Connection::Connected;
                    state.generation += 1;
                    Some((waiters, state.generation))
                }
                Connection::Disconnected => None,
                other => {
                    state.connection = other;
                    return;
                }
            }
        };

        match waiters {
            Some((waiters, generation)) => {
                info!(device = %self.id(), generation, "connected");
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            None => {
                debug!(device = %self.id(), "dropping connection nobody is waiting for");
                self.peripheral.disconnect();
            }
        }
    }

    fn did_fail_to_connect(self: Arc<Self>, error: Error) {
        self.fail_connect(error);
    }

    fn did_disconnect(self: Arc<Self>, error: Option<Error>) {
        self.link_down(error);
    }

    fn did_receive_notification(
        self: Arc<Self>,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    ) {
        let Some(id) = self.adapter().id_of(characteristic.as_native()) else {
            debug!(device = %self.id(), %characteristic, "notification for unknown attribute");
            return;
        };

        let target = {
            let mut state = lock(&self.session.state);
            if state.current_generation().is_err() {
                return;
            }
            match state.tree.characteristic_mut(id) {
                Ok(node) => {
                    node.value = Some(value.clone());
                    node.written = false;
                }
                Err(_) => return,
            }
            self.characteristic_object(&state, id)
        };

        if let Some(target) = target {
            trace!(
                device = %self.id(),
                characteristic = %id,
                len = value.len(),
                "notification"
            );
            self.dispatch_value_changed(target, value);
        }
    }

    fn did_modify_services(
        self: Arc<Self>,
        modified: Vec<ServiceInfo>,
        removed: Vec<ServiceHandle>,
    ) {
        let adapter = self.adapter().clone();
        let mut events = Vec::new();
        let mut released = Vec::new();
        {
            let mut state = lock(&self.session.state);
            if state.current_generation().is_err() {
                return;
            }

            for info in modified {
                // Only primary services the application may see are announced. Known
                // services of any kind still lose their memoized children.
                let visible = info.is_primary && self.is_allowed(&info.uuid);
                let known = adapter
                    .id_of(info.handle.as_native())
                    .filter(|id| state.tree.service(*id).is_ok());
                match known {
                    Some(id) => {
                        released.extend(state.tree.clear_children(id));
                        if visible {
                            events.extend(
                                self.service_object(&state, id)
                                    .map(ServerEvent::ServiceChanged),
                            );
                        }
                    }
                    None if !visible => continue,
                    None => {
                        // Undiscovered trees pick the service up on first discovery.
                        let Discovery::Discovered(_) = state.tree.services else {
                            continue;
                        };
                        let (id, _) = adapter.register(info.native(), info.meta(self.id()));
                        let node = info.into_node(self.peripheral_id);
                        state.tree.nodes.insert(id, node);
                        if let Discovery::Discovered(ids) = &mut state.tree.services {
                            ids.push(id);
                        }
                        events.extend(
                            self.service_object(&state, id)
                                .map(ServerEvent::ServiceAdded),
                        );
                    }
                }
            }

            for handle in removed {
                let Some(id) = adapter.id_of(handle.as_native()) else {
                    continue;
                };
                let Some(service) = self.service_object(&state, id) else {
                    continue;
                };
                released.extend(state.tree.clear_children(id));
                state.tree.nodes.remove(&id);
                if let Discovery::Discovered(ids) = &mut state.tree.services {
                    ids.retain(|s| *s != id);
                }
                for node in state.tree.nodes.values_mut() {
                    if let Node::Service(node) = node {
                        if let Discovery::Discovered(ids) = &mut node.included {
                            ids.retain(|s| *s != id);
                        }
                    }
                }
                released.push(id);
                if service.is_primary() && self.is_allowed(&service.uuid()) {
                    events.push(ServerEvent::ServiceRemoved(service));
                }
            }
        }

        adapter.release_many(released);
        for event in events {
            debug!(device = %self.id(), ?event, "service change");
            self.dispatch_server_event(event);
        }
    }

    fn is_linked(&self) -> bool {
        !matches!(lock(&self.session.state).connection, Connection::Disconnected)
    }
}
