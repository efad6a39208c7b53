//! Transport observers
//!
//! Notification iterates over a snapshot of the list, and each entry is
//! re-checked before it is called, so a callback may unregister itself or any
//! other observer mid-notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Listener for transport events
pub trait TransportObserver: Send + Sync {
    fn on_data_available(&self) {}

    fn on_disconnected(&self) {}
}

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct ObserverList {
    entries: RwLock<Vec<(ObserverId, Arc<dyn TransportObserver>)>>,
    next_id: AtomicU64,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn TransportObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: ObserverId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(entry_id, _)| *entry_id == id)
    }

    pub fn for_each(&self, f: impl Fn(&dyn TransportObserver)) {
        let snapshot = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (id, observer) in snapshot {
            if self.contains(id) {
                f(observer.as_ref());
            }
        }
    }
}
