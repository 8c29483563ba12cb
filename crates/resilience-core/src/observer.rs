//! Synchronous observer list with idempotent registration.
//!
//! Emission works on a snapshot of the registered callbacks taken under the
//! lock, so callbacks may subscribe or unsubscribe (including themselves)
//! while being called. A callback removed during an emission round still
//! receives that round.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

/// Handle returned by [`ObserverList::subscribe`].
pub type ObserverId = u64;

type Callback<T> = dyn Fn(&T) + Send + Sync;

pub struct ObserverList<T> {
    observers: Mutex<Vec<(ObserverId, Arc<Callback<T>>)>>,
    next_id: AtomicU64,
}

impl<T> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove an observer. Unknown or already-removed ids are ignored.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Arc<Callback<T>>> = {
            let guard = self.observers.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ObserverList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn notifies_every_subscriber() {
        let list = ObserverList::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = total.clone();
            list.subscribe(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        list.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let list = ObserverList::<()>::new();
        let id = list.subscribe(|_| {});
        assert!(list.unsubscribe(id));
        assert!(!list.unsubscribe(id));
        assert!(!list.unsubscribe(9_999));
        assert!(list.is_empty());
    }

    #[test]
    fn callback_may_unsubscribe_itself_during_notify() {
        let list = Arc::new(ObserverList::<()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(AtomicU64::new(0));

        let id = {
            let list_ref = Arc::downgrade(&list);
            let calls = calls.clone();
            let slot = slot.clone();
            list.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(list) = list_ref.upgrade() {
                    list.unsubscribe(slot.load(Ordering::SeqCst));
                }
            })
        };
        slot.store(id, Ordering::SeqCst);

        list.notify(&());
        list.notify(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
