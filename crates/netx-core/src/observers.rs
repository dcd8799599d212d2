//! Fire-and-forget observers for packet and session events.
//!
//! Observers are invoked over a snapshot of the registry, so an observer may
//! register or remove listeners while it runs. A panicking observer is
//! logged and skipped.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Handle returned on registration, used to remove a listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey(u64);

type PacketReceived<T> = Arc<dyn Fn(&T, Uuid) + Send + Sync>;
type PacketSent<T> = Arc<dyn Fn(&T) + Send + Sync>;
type SessionEvent = Arc<dyn Fn(Uuid) + Send + Sync>;

type Listeners<F> = RwLock<BTreeMap<ListenerKey, F>>;

/// Registered observers, fired in registration order.
pub struct Observers<T> {
    next_key: AtomicU64,
    packet_received: Listeners<PacketReceived<T>>,
    packet_sent: Listeners<PacketSent<T>>,
    client_connect: Listeners<SessionEvent>,
    client_disconnect: Listeners<SessionEvent>,
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Self {
            next_key: AtomicU64::new(1),
            packet_received: RwLock::new(BTreeMap::new()),
            packet_sent: RwLock::new(BTreeMap::new()),
            client_connect: RwLock::new(BTreeMap::new()),
            client_disconnect: RwLock::new(BTreeMap::new()),
        }
    }

    fn key(&self) -> ListenerKey {
        ListenerKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Called with every decoded `Type` value and the session it came from.
    pub fn on_packet_received(
        &self,
        listener: impl Fn(&T, Uuid) + Send + Sync + 'static,
    ) -> ListenerKey {
        let key = self.key();
        insert(&self.packet_received, key, Arc::new(listener));
        key
    }

    /// Called with every `Type` value written by this endpoint.
    pub fn on_packet_sent(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerKey {
        let key = self.key();
        insert(&self.packet_sent, key, Arc::new(listener));
        key
    }

    pub fn on_client_connect(&self, listener: impl Fn(Uuid) + Send + Sync + 'static) -> ListenerKey {
        let key = self.key();
        insert(&self.client_connect, key, Arc::new(listener));
        key
    }

    pub fn on_client_disconnect(
        &self,
        listener: impl Fn(Uuid) + Send + Sync + 'static,
    ) -> ListenerKey {
        let key = self.key();
        insert(&self.client_disconnect, key, Arc::new(listener));
        key
    }

    /// Remove a listener of any kind. Returns false if the key is unknown.
    pub fn remove(&self, key: ListenerKey) -> bool {
        remove(&self.packet_received, key)
            || remove(&self.packet_sent, key)
            || remove(&self.client_connect, key)
            || remove(&self.client_disconnect, key)
    }

    pub fn packet_received_count(&self) -> usize {
        count(&self.packet_received)
    }

    pub fn packet_sent_count(&self) -> usize {
        count(&self.packet_sent)
    }

    pub fn client_connect_count(&self) -> usize {
        count(&self.client_connect)
    }

    pub fn client_disconnect_count(&self) -> usize {
        count(&self.client_disconnect)
    }

    pub fn fire_packet_received(&self, value: &T, sender: Uuid) {
        for listener in snapshot(&self.packet_received) {
            guarded("packet_received", || listener(value, sender));
        }
    }

    pub fn fire_packet_sent(&self, value: &T) {
        for listener in snapshot(&self.packet_sent) {
            guarded("packet_sent", || listener(value));
        }
    }

    pub fn fire_client_connect(&self, session_id: Uuid) {
        for listener in snapshot(&self.client_connect) {
            guarded("client_connect", || listener(session_id));
        }
    }

    pub fn fire_client_disconnect(&self, session_id: Uuid) {
        for listener in snapshot(&self.client_disconnect) {
            guarded("client_disconnect", || listener(session_id));
        }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn insert<F>(listeners: &Listeners<F>, key: ListenerKey, listener: F) {
    listeners
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, listener);
}

fn remove<F>(listeners: &Listeners<F>, key: ListenerKey) -> bool {
    listeners
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&key)
        .is_some()
}

fn count<F>(listeners: &Listeners<F>) -> usize {
    listeners.read().unwrap_or_else(PoisonError::into_inner).len()
}

fn snapshot<F: Clone>(listeners: &Listeners<F>) -> Vec<F> {
    listeners
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect()
}

fn guarded(event: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(event, "observer panicked");
    }
}
