//! Live connection registry

use lumen_util::{ConnectionId, ConnectionIdAllocator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::SocketConnection;

/// Owns every live connection. Removing one tears it down.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<SocketConnection>>>,
    ids: ConnectionIdAllocator,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint an id for a connection about to be added
    pub fn next_id(&self) -> ConnectionId {
        self.ids.next_id()
    }

    pub fn add(&self, connection: Arc<SocketConnection>) {
        let id = connection.id();
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, connection);
        info!(connection_id = %id, "Connection added");
    }

    /// Remove and close a connection. Returns false when it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        // Closed outside the lock; closing waits for a running handler
        match removed {
            Some(connection) => {
                connection.close();
                info!(connection_id = %id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Close every connection; returns how many there were
    pub fn clear(&self) -> usize {
        let drained: Vec<Arc<SocketConnection>> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in &drained {
            connection.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all connections");
        }
        drained.len()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<SocketConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::tests::{connect, shared};
    use std::collections::HashSet;

    #[tokio::test]
    async fn ids_are_unique_per_registry() {
        let shared = shared();
        let ids: HashSet<_> = (0..100).map(|_| shared.registry.next_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let shared = shared();
        let (connection, _client) = connect(&shared);
        let id = connection.id();

        assert!(shared.registry.contains(id));
        assert!(shared.registry.remove(id));
        assert!(connection.is_closed());
        assert!(!shared.registry.remove(id));
        assert!(shared.registry.get(id).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_removals_remove_once() {
        for _ in 0..50 {
            let shared = shared();
            let (connection, _client) = connect(&shared);
            let id = connection.id();

            let first = shared.registry.clone();
            let second = shared.registry.clone();
            let a = std::thread::spawn(move || first.remove(id));
            let b = std::thread::spawn(move || second.remove(id));
            let (a, b) = (a.join().unwrap(), b.join().unwrap());

            assert!(a ^ b, "exactly one removal must win");
            assert!(connection.is_closed());
            assert!(shared.registry.is_empty());
        }
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let shared = shared();
        let connections: Vec<_> = (0..3).map(|_| connect(&shared)).collect();
        assert_eq!(shared.registry.len(), 3);

        assert_eq!(shared.registry.clear(), 3);
        assert!(shared.registry.is_empty());
        for (connection, _client) in &connections {
            assert!(connection.is_closed());
        }
        assert_eq!(shared.registry.clear(), 0);
    }

    #[tokio::test]
    async fn removal_closes_the_socket() {
        let shared = shared();
        let (connection, client) = connect(&shared);
        shared.registry.remove(connection.id());

        let mut byte = [0u8; 1];
        assert!(client.receive(&mut byte).await.is_err());
    }
}
