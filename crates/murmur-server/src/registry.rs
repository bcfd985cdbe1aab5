//! Connection registry: live relay sockets grouped by user.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Bounded per-connection outbound buffer. A consumer further behind than
/// this is dropped from, not waited on.
pub const SESSION_BUFFER: usize = 256;

/// Type alias for the per-user connection bucket.
type ConnectionMap = HashMap<String, HashMap<Uuid, mpsc::Sender<String>>>;

/// Tracks every live relay socket, keyed by user id and connection id.
///
/// All operations take the single map lock, so registry mutations for one
/// user are mutually exclusive. Fan-out never awaits a slow peer: each
/// connection has a bounded channel and delivery uses `try_send`.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<ConnectionMap>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a connection under its user, creating the user's bucket on
    /// demand. Admitting the same connection id twice replaces the sender,
    /// so re-admission is idempotent.
    pub async fn admit(&self, user_id: &str, conn_id: Uuid, sender: mpsc::Sender<String>) {
        let mut connections = self.connections.write().await;
        connections
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id, sender);
    }

    /// Removes a connection; the user's bucket is dropped when it empties.
    pub async fn remove(&self, user_id: &str, conn_id: Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(bucket) = connections.get_mut(user_id) {
            bucket.remove(&conn_id);
            if bucket.is_empty() {
                connections.remove(user_id);
            }
        }
    }

    /// Best-effort delivery of `payload` to every live connection of
    /// `user_id` except `excluding`. A full or closed peer channel is
    /// logged and skipped; it never aborts delivery to the rest.
    ///
    /// Returns the number of connections the payload was handed to.
    pub async fn fan_out(&self, user_id: &str, payload: &str, excluding: Uuid) -> usize {
        let connections = self.connections.read().await;
        let Some(bucket) = connections.get(user_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (conn_id, sender) in bucket {
            if *conn_id == excluding {
                continue;
            }
            match sender.try_send(payload.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        conn_id = %conn_id,
                        "dropping relayed frame for slow consumer: {}",
                        e
                    );
                }
            }
        }
        delivered
    }

    /// Number of live connections for a user.
    pub async fn connection_count(&self, user_id: &str) -> usize {
        let connections = self.connections.read().await;
        connections.get(user_id).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_skips_the_sender() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();

        for _ in 0..4 {
            let (tx, rx) = mpsc::channel(SESSION_BUFFER);
            let conn_id = Uuid::new_v4();
            registry.admit("u1", conn_id, tx).await;
            receivers.push(rx);
            ids.push(conn_id);
        }

        let delivered = registry.fan_out("u1", "ping", ids[0]).await;
        assert_eq!(delivered, 3);
        assert!(receivers[0].try_recv().is_err(), "sender must be excluded");
        for rx in receivers.iter_mut().skip(1) {
            assert_eq!(rx.try_recv().ok().as_deref(), Some("ping"));
        }
    }

    #[tokio::test]
    async fn fan_out_survives_a_full_peer() {
        let registry = ConnectionRegistry::new();
        let sender_id = Uuid::new_v4();
        let (sender_tx, _sender_rx) = mpsc::channel(1);
        registry.admit("u1", sender_id, sender_tx).await;

        // Peer with a single-slot buffer that is already full.
        let (full_tx, mut full_rx) = mpsc::channel(1);
        full_tx.try_send("stale".to_string()).unwrap();
        registry.admit("u1", Uuid::new_v4(), full_tx).await;

        let (ok_tx, mut ok_rx) = mpsc::channel(SESSION_BUFFER);
        registry.admit("u1", Uuid::new_v4(), ok_tx).await;

        let delivered = registry.fan_out("u1", "ping", sender_id).await;
        assert_eq!(delivered, 1, "only the healthy peer receives");
        assert_eq!(ok_rx.try_recv().ok().as_deref(), Some("ping"));
        assert_eq!(full_rx.try_recv().ok().as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn remove_drops_empty_buckets() {
        let registry = ConnectionRegistry::new();
        let conn_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(SESSION_BUFFER);

        registry.admit("u1", conn_id, tx).await;
        assert_eq!(registry.connection_count("u1").await, 1);

        registry.remove("u1", conn_id).await;
        assert_eq!(registry.connection_count("u1").await, 0);
        assert_eq!(registry.fan_out("u1", "ping", Uuid::new_v4()).await, 0);
    }

    #[tokio::test]
    async fn readmission_replaces_the_sender() {
        let registry = ConnectionRegistry::new();
        let conn_id = Uuid::new_v4();

        let (old_tx, mut old_rx) = mpsc::channel(SESSION_BUFFER);
        registry.admit("u1", conn_id, old_tx).await;
        let (new_tx, mut new_rx) = mpsc::channel(SESSION_BUFFER);
        registry.admit("u1", conn_id, new_tx).await;

        assert_eq!(registry.connection_count("u1").await, 1);
        registry.fan_out("u1", "ping", Uuid::new_v4()).await;
        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.try_recv().ok().as_deref(), Some("ping"));
    }
}
