//! In-memory registry of live client connections.
//!
//! Explicitly constructed and injected at server start — never a global.
//! The coordinator consults it to prefer direct delivery over push.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Handle to one live connection: a monotonic id plus the sender side of
/// the connection's outbound frame channel.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(id: u64, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for the connection's writer task. Returns false when
    /// the connection is already gone.
    pub fn send(&self, frame: String) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Registry mapping a logged-in client id to its live connection handle.
#[derive(Default)]
pub struct ConnectionTable {
    inner: RwLock<HashMap<String, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection id for a freshly accepted connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a connection for a client, superseding any previous one.
    pub fn register(&self, client_id: &str, handle: ConnectionHandle) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.insert(client_id.to_string(), handle) {
            tracing::debug!(
                client = %client_id,
                superseded = old.id(),
                "connection superseded by a newer one"
            );
        }
    }

    /// Remove a connection, but only if `handle` is still the registered
    /// one. A stale close of a superseded connection must not evict the
    /// newer, still-live connection (reconnect-storm race).
    pub fn unregister(&self, client_id: &str, handle: &ConnectionHandle) -> bool {
        let mut inner = self.inner.write();
        match inner.get(client_id) {
            Some(current) if current.id() == handle.id() => {
                inner.remove(client_id);
                true
            }
            Some(current) => {
                tracing::debug!(
                    client = %client_id,
                    closing = handle.id(),
                    current = current.id(),
                    "ignoring unregister of superseded connection"
                );
                false
            }
            None => false,
        }
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.inner.read().contains_key(client_id)
    }

    pub fn connection_for(&self, client_id: &str) -> Option<ConnectionHandle> {
        self.inner.read().get(client_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(table: &ConnectionTable) -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(table.next_connection_id(), tx), rx)
    }

    #[test]
    fn register_and_lookup() {
        let table = ConnectionTable::new();
        let (h, _rx) = handle(&table);
        assert!(!table.is_online("alice"));
        table.register("alice", h);
        assert!(table.is_online("alice"));
        assert!(table.connection_for("alice").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_unregister_does_not_evict_newer_connection() {
        let table = ConnectionTable::new();
        let (old, _rx1) = handle(&table);
        let (new, _rx2) = handle(&table);

        table.register("alice", old.clone());
        // Reconnect supersedes before the old connection's close arrives.
        table.register("alice", new.clone());

        // The late close of the superseded connection is a no-op.
        assert!(!table.unregister("alice", &old));
        assert!(table.is_online("alice"));
        assert_eq!(table.connection_for("alice").unwrap().id(), new.id());

        // The current connection's close removes the entry.
        assert!(table.unregister("alice", &new));
        assert!(!table.is_online("alice"));
    }

    #[test]
    fn send_fails_once_receiver_dropped() {
        let table = ConnectionTable::new();
        let (h, rx) = handle(&table);
        assert!(h.send("frame".into()));
        drop(rx);
        assert!(!h.send("frame".into()));
    }
}
