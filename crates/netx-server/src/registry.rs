//! Session registry: session id to connection.
//!
//! Tracks every registered session plus the ids still in handshake, so a
//! freshly generated id never collides with either.

use netx_core::handshake::generate_session_id;
use netx_core::{ConnectionHandler, SignalKind, Uuid};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Inner<T> {
    sessions: HashMap<Uuid, Arc<ConnectionHandler<T>>>,
    reserved: HashSet<Uuid>,
}

/// Registered sessions of one server.
pub struct SessionRegistry<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                reserved: HashSet::new(),
            }),
        }
    }

    /// Allocate a fresh session id, regenerating on collision.
    pub async fn reserve_id(&self) -> Uuid {
        let mut inner = self.inner.write().await;
        loop {
            let id = generate_session_id();
            if inner.sessions.contains_key(&id) || inner.reserved.contains(&id) {
                debug!(session_id = %id, "session id collision, regenerating");
                continue;
            }
            inner.reserved.insert(id);
            return id;
        }
    }

    /// Give back an id whose handshake failed.
    pub async fn release_id(&self, id: Uuid) {
        self.inner.write().await.reserved.remove(&id);
    }

    /// Register a session under its id, consuming the reservation.
    pub async fn insert(&self, conn: Arc<ConnectionHandler<T>>) {
        let id = conn.session_id();
        let mut inner = self.inner.write().await;
        inner.reserved.remove(&id);
        inner.sessions.insert(id, conn);
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<ConnectionHandler<T>>> {
        self.inner.write().await.sessions.remove(id)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<ConnectionHandler<T>>> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.inner.read().await.sessions.contains_key(id)
    }

    pub async fn peer_addr(&self, id: &Uuid) -> Option<SocketAddr> {
        self.get(id).await.and_then(|conn| conn.peer_addr())
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.inner.read().await.sessions.keys().copied().collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Remove and return every session.
    pub async fn drain(&self) -> Vec<Arc<ConnectionHandler<T>>> {
        let mut inner = self.inner.write().await;
        inner.reserved.clear();
        inner.sessions.drain().map(|(_, conn)| conn).collect()
    }

    /// Write one `Type` payload to every session. A failed recipient is
    /// logged and skipped.
    pub async fn broadcast(&self, payload: &[u8]) -> BroadcastReport {
        // Snapshot so slow writers do not hold the registry lock.
        let sessions: Vec<_> = self.inner.read().await.sessions.values().cloned().collect();

        let mut report = BroadcastReport::default();
        for conn in sessions {
            let id = conn.session_id();
            match conn.write(SignalKind::Type, payload).await {
                Ok(()) => report.delivered.push(id),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "broadcast delivery failed");
                    report.failed.push(id);
                }
            }
        }
        report
    }
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netx_core::handshake::derive_key;
    use netx_core::{CipherAlgorithm, ConnectionOptions};

    type Conn = ConnectionHandler<String>;

    fn open_conn(stream: tokio::io::DuplexStream) -> Arc<Conn> {
        let conn = Conn::new(stream, None, ConnectionOptions::default());
        let id = Uuid::new_v4();
        conn.set_session_id(id);
        conn.open_raw().unwrap();
        conn.open(&derive_key(&id.to_string(), CipherAlgorithm::default()).unwrap())
            .unwrap();
        Arc::new(conn)
    }

    #[tokio::test]
    async fn reserve_insert_remove() {
        let registry = SessionRegistry::<String>::new();
        let id = registry.reserve_id().await;
        assert_ne!(registry.reserve_id().await, id);
        assert_eq!(registry.count().await, 0);

        let (a, _b) = tokio::io::duplex(1024);
        let conn = Conn::new(a, None, ConnectionOptions::default());
        conn.set_session_id(id);
        registry.insert(Arc::new(conn)).await;

        assert!(registry.contains(&id).await);
        assert_eq!(registry.ids().await, vec![id]);
        assert!(registry.remove(&id).await.is_some());
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn broadcast_skips_broken_session() {
        let registry = SessionRegistry::<String>::new();
        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (a, b) = tokio::io::duplex(4096);
            let conn = open_conn(a);
            ids.push(conn.session_id());
            registry.insert(conn).await;
            peers.push(b);
        }

        let broken = registry.get(&ids[1]).await.unwrap();
        broken.close().await;

        let report = registry.broadcast(b"hello").await;
        assert_eq!(report.failed, vec![ids[1]]);
        assert_eq!(report.delivered.len(), 2);
        assert!(report.delivered.contains(&ids[0]));
        assert!(report.delivered.contains(&ids[2]));
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn drain_empties_registry() {
        let registry = SessionRegistry::<String>::new();
        let (a, _b) = tokio::io::duplex(1024);
        registry.insert(open_conn(a)).await;
        assert_eq!(registry.drain().await.len(), 1);
        assert_eq!(registry.count().await, 0);
    }
}
