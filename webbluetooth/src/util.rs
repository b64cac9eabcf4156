use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct ScopeGuard<F: FnOnce()> {
    dropfn: ManuallyDrop<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        // SAFETY: `dropfn` is dropped exactly once here and `self` is forgotten, so `Drop`
        // never sees it again.
        unsafe { ManuallyDrop::drop(&mut self.dropfn) }
        std::mem::forget(self)
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        // SAFETY: This is OK because `dropfn` is `ManuallyDrop` which will not be dropped by the compiler.
        let dropfn = unsafe { ManuallyDrop::take(&mut self.dropfn) };
        dropfn();
    }
}

/// Runs `dropfn` when the returned guard goes out of scope, unless it is defused.
pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard {
        dropfn: ManuallyDrop::new(dropfn),
    }
}

pub struct BroadcastSender<T> {
    sender: async_broadcast::Sender<T>,
    _keep_alive: async_broadcast::InactiveReceiver<T>,
}

impl<T> Deref for BroadcastSender<T> {
    type Target = async_broadcast::Sender<T>;

    fn deref(&self) -> &Self::Target {
        &self.sender
    }
}

impl<T> DerefMut for BroadcastSender<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.sender
    }
}

pub type BroadcastReceiver<T> = async_broadcast::Receiver<T>;

pub fn broadcast<T>(cap: usize) -> BroadcastSender<T> {
    let (mut sender, receiver) = async_broadcast::broadcast(cap);
    sender.set_overflow(true);
    BroadcastSender {
        sender,
        _keep_alive: receiver.deactivate(),
    }
}

pub fn watch<T>() -> BroadcastSender<T> {
    broadcast(1)
}

/// Locks a mutex, ignoring poisoning. Listener panics are caught before they can poison
/// state, so a poisoned lock still guards consistent data.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn guard_runs_unless_defused() {
        let ran = Cell::new(0);
        {
            let _guard = defer(|| ran.set(ran.get() + 1));
        }
        assert_eq!(ran.get(), 1);
        defer(|| ran.set(ran.get() + 1)).defuse();
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn watch_keeps_latest_value() {
        let sender = watch();
        let mut receiver = sender.new_receiver();
        sender.try_broadcast(1).unwrap();
        let _ = sender.try_broadcast(2);
        let latest = std::iter::from_fn(|| match receiver.try_recv() {
            Ok(value) => Some(Some(value)),
            Err(async_broadcast::TryRecvError::Overflowed(_)) => Some(None),
            Err(_) => None,
        })
        .flatten()
        .last();
        assert_eq!(latest, Some(2));
    }
}
