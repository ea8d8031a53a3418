//! Client connection registry
//!
//! Tracks every connected client together with the mpsc handle used to
//! queue outbound envelopes to its writer task. The registry is the
//! broadcaster's source of truth: fan-out iterates a snapshot taken here.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use taskd_protocol::IpcMessage;

/// Outbound queue depth per client before events start being dropped
/// for that client (slow consumer).
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Generate a short opaque client identifier (12 hex chars).
pub fn new_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// Entry for a connected client
pub struct ClientEntry {
    /// Channel feeding this client's writer task
    pub sender: mpsc::Sender<IpcMessage>,
    /// When the connection was acknowledged
    pub connected_at: DateTime<Utc>,
}

impl std::fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEntry")
            .field("connected_at", &self.connected_at)
            .field("sender_closed", &self.sender.is_closed())
            .finish()
    }
}

/// Registry tracking all connected clients
///
/// Thread-safe for concurrent access from connection handler tasks and
/// the broadcaster.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, ClientEntry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a client under its server-assigned id.
    ///
    /// Ids are generated by [`new_client_id`] so collisions are not a
    /// practical concern; if one ever occurs the old entry is replaced
    /// and a warning is logged.
    pub fn add(&self, client_id: impl Into<String>, sender: mpsc::Sender<IpcMessage>) {
        let client_id = client_id.into();
        let entry = ClientEntry {
            sender,
            connected_at: Utc::now(),
        };
        if self.clients.insert(client_id.clone(), entry).is_some() {
            warn!("Client id collision, replacing entry: {}", client_id);
        } else {
            debug!("Registered client {}", client_id);
        }
    }

    /// Remove the entry whose sender is the given handle.
    ///
    /// Disconnects resolve by handle identity rather than by id, so a
    /// reconnect that happened to reuse an id can never evict the newer
    /// connection. Returns the removed client's id.
    pub fn remove_by_handle(&self, handle: &mpsc::Sender<IpcMessage>) -> Option<String> {
        let id = self
            .clients
            .iter()
            .find(|entry| entry.sender.same_channel(handle))
            .map(|entry| entry.key().clone())?;
        self.clients.remove(&id);
        debug!("Unregistered client {}", id);
        Some(id)
    }

    /// Look up the outbound handle for a client id.
    pub fn get(&self, client_id: &str) -> Option<mpsc::Sender<IpcMessage>> {
        self.clients.get(client_id).map(|entry| entry.sender.clone())
    }

    /// Immutable snapshot of all connected clients.
    ///
    /// Clients that join after the snapshot is taken are not included;
    /// clients that leave mid-iteration simply fail their send.
    pub fn all(&self) -> Vec<(String, mpsc::Sender<IpcMessage>)> {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.sender.clone()))
            .collect()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("client_count", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskd_protocol::{Ack, IpcMessage};

    fn ack_message(id: &str) -> IpcMessage {
        IpcMessage::ack(Ack {
            client_id: id.to_string(),
            pid: 1,
            ppid: 0,
        })
    }

    #[test]
    fn test_new_client_id_shape() {
        let id = new_client_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_client_id_unique() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| new_client_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.add("abc123", tx);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("abc123"));

        let sender = registry.get("abc123").unwrap();
        sender.send(ack_message("abc123")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(IpcMessage::Ack { .. })));
    }

    #[tokio::test]
    async fn test_get_unknown() {
        let registry = ClientRegistry::new();
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_remove_by_handle() {
        let registry = ClientRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        registry.add("one", tx1.clone());
        registry.add("two", tx2);

        let removed = registry.remove_by_handle(&tx1);
        assert_eq!(removed.as_deref(), Some("one"));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("two"));
    }

    #[tokio::test]
    async fn test_remove_by_unknown_handle() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.add("one", tx);

        let (stranger, _rx2) = mpsc::channel(4);
        assert!(registry.remove_by_handle(&stranger).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_by_handle_spares_replacement() {
        // A stale handle for a replaced id must not evict the newer entry.
        let registry = ClientRegistry::new();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);
        registry.add("dup", old_tx.clone());
        registry.add("dup", new_tx.clone());

        assert!(registry.remove_by_handle(&old_tx).is_none());
        assert!(registry.get("dup").unwrap().same_channel(&new_tx));
    }

    #[tokio::test]
    async fn test_all_snapshot() {
        let registry = ClientRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        registry.add("one", tx1);
        registry.add("two", tx2);

        let snapshot = registry.all();
        assert_eq!(snapshot.len(), 2);
        let ids: Vec<_> = snapshot.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"one"));
        assert!(ids.contains(&"two"));
    }
}
