//! Bookkeeping of native handles.
//!
//! The registry owns every native handle the session layer holds. Each handle is assigned a
//! [`HandleId`] when it is first seen; objects handed to the application keep only the id,
//! so a handle can never be used after it has been released back to the native layer.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;
use webbluetooth_binding::{NativeBinding, NativeHandle};

use crate::error::{Error, ErrorKind, Result};

/// A session-scoped identifier for a native handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a registered handle refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleMeta {
    Adapter,
    Peripheral { device_id: String },
    Service { device_id: String, uuid: Uuid },
    Characteristic { device_id: String, uuid: Uuid },
    Descriptor { device_id: String, uuid: Uuid },
}

#[derive(Debug)]
struct Entry {
    handle: NativeHandle,
    meta: HandleMeta,
}

/// A bidirectional map between native handles and [`HandleId`]s.
pub struct HandleRegistry {
    binding: Arc<dyn NativeBinding>,
    next_id: u64,
    entries: HashMap<HandleId, Entry>,
    ids: HashMap<NativeHandle, HandleId>,
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("next_id", &self.next_id)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl HandleRegistry {
    pub fn new(binding: Arc<dyn NativeBinding>) -> Self {
        HandleRegistry {
            binding,
            next_id: 1,
            entries: HashMap::new(),
            ids: HashMap::new(),
        }
    }

    /// Registers a native handle.
    ///
    /// Returns the id of the handle and whether it was newly registered. A handle that is
    /// already registered keeps its id and metadata.
    pub fn register(&mut self, handle: NativeHandle, meta: HandleMeta) -> (HandleId, bool) {
        if let Some(id) = self.ids.get(&handle) {
            return (*id, false);
        }

        let id = HandleId(self.next_id);
        self.next_id += 1;
        debug!(%id, %handle, ?meta, "registered handle");
        self.ids.insert(handle.clone(), id);
        self.entries.insert(id, Entry { handle, meta });
        (id, true)
    }

    /// Returns the native handle for `id`.
    pub fn lookup(&self, id: HandleId) -> Result<&NativeHandle> {
        self.entry(id).map(|entry| &entry.handle)
    }

    pub fn meta(&self, id: HandleId) -> Result<&HandleMeta> {
        self.entry(id).map(|entry| &entry.meta)
    }

    fn entry(&self, id: HandleId) -> Result<&Entry> {
        match self.entries.get(&id) {
            Some(entry) => Ok(entry),
            None if self.was_issued(id) => Err(Error::new(
                ErrorKind::InvalidState,
                format!("handle {id} has been released"),
            )),
            None => Err(Error::new(
                ErrorKind::NotFound,
                format!("handle {id} was never issued"),
            )),
        }
    }

    /// Returns the id of a registered native handle.
    pub fn id_of(&self, handle: &NativeHandle) -> Option<HandleId> {
        self.ids.get(handle).copied()
    }

    /// Frees the native handle behind `id` and forgets it.
    pub fn release(&mut self, id: HandleId) -> Result<()> {
        let Some(entry) = self.entries.remove(&id) else {
            let err = self.entry(id).err();
            return Err(err.unwrap_or_else(|| ErrorKind::InvalidState.into()));
        };
        self.ids.remove(&entry.handle);
        debug!(%id, handle = %entry.handle, "releasing handle");
        self.binding.release(&entry.handle);
        Ok(())
    }

    /// Releases every id in `ids`, ignoring ids that are no longer registered.
    pub fn release_many(&mut self, ids: impl IntoIterator<Item = HandleId>) {
        for id in ids {
            if let Err(err) = self.release(id) {
                warn!(%id, "{err}");
            }
        }
    }

    /// Frees every registered handle.
    pub fn release_all(&mut self) {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        // Children before parents, the adapter last.
        ids.sort_unstable_by(|a, b| b.cmp(a));
        self.release_many(ids);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn was_issued(&self, id: HandleId) -> bool {
        id.0 > 0 && id.0 < self.next_id
    }
}
