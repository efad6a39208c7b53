//! Resources kept alive until the response that references them is written
//!
//! A handler may hand out a buffer whose backing memory must outlive the
//! handler call. It saves a reference under the (connection, token) pair of
//! its pending response; the sender releases the entry once the response
//! bytes and descriptors have left, or when the connection is torn down.

use lumen_util::ConnectionId;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// A shared reference the cache keeps alive
pub type Resource = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub connection: ConnectionId,
    pub token: u64,
}

#[derive(Default)]
pub struct ResourceCache {
    entries: Mutex<HashMap<ResourceKey, Vec<Resource>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, key: ResourceKey, resource: Resource) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .push(resource);
    }

    /// Drop everything saved under `key`; returns how many references went
    pub fn release(&self, key: ResourceKey) -> usize {
        let released = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        // Dropped after the lock so resource destructors never run under it
        let count = released.map_or(0, |r| r.len());
        if count > 0 {
            trace!(connection_id = %key.connection, token = key.token, count, "Released resources");
        }
        count
    }

    /// Drop everything saved for any response of `connection`
    pub fn release_connection(&self, connection: ConnectionId) -> usize {
        let released: Vec<Vec<Resource>> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<ResourceKey> = entries
                .keys()
                .filter(|k| k.connection == connection)
                .copied()
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        released.iter().map(Vec::len).sum()
    }

    /// Total references held
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(connection: i32, token: u64) -> ResourceKey {
        ResourceKey {
            connection: ConnectionId::from_raw(connection),
            token,
        }
    }

    #[test]
    fn saved_resources_stay_alive_until_released() {
        let cache = ResourceCache::new();
        let buffer: Arc<Vec<u8>> = Arc::new(vec![0; 16]);
        cache.save(key(1, 1), buffer.clone());
        cache.save(key(1, 1), buffer.clone());
        assert_eq!(Arc::strong_count(&buffer), 3);

        assert_eq!(cache.release(key(1, 1)), 2);
        assert_eq!(Arc::strong_count(&buffer), 1);
        assert_eq!(cache.release(key(1, 1)), 0);
    }

    #[test]
    fn release_connection_leaves_other_connections() {
        let cache = ResourceCache::new();
        cache.save(key(1, 1), Arc::new(1u32));
        cache.save(key(1, 2), Arc::new(2u32));
        cache.save(key(2, 1), Arc::new(3u32));

        assert_eq!(cache.release_connection(ConnectionId::from_raw(1)), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.release(key(2, 1)), 1);
        assert!(cache.is_empty());
    }
}
