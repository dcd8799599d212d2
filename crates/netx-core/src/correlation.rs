//! Pending await callbacks for one session.
//!
//! Requests are correlated strictly by correlation id, so any number of
//! requests may be in flight on a session at once. `Type` frames carry no
//! id; an await on them is resolved by the next inbound `Type` frame, most
//! recently registered waiter first. Two overlapping plain awaits on the
//! same session can therefore be answered out of order.
//!
//! A waiter that gives up between being popped and being sent to hands the
//! value back, and it moves on to the next live waiter. One window remains:
//! a value sent after the caller's timeout fired but before its receiver
//! dropped is lost to that caller. Observers still see it.

use crate::message::Response;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Identifies one registered plain await so it can be withdrawn on timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AwaitToken(u64);

/// One-shot callbacks waiting on replies from the peer.
pub struct CorrelationStore<T> {
    awaits: Mutex<Vec<(AwaitToken, oneshot::Sender<T>)>>,
    requests: Mutex<HashMap<Uuid, oneshot::Sender<Response>>>,
    next_token: AtomicU64,
}

impl<T> CorrelationStore<T> {
    pub fn new() -> Self {
        Self {
            awaits: Mutex::new(Vec::new()),
            requests: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a waiter for the next inbound `Type` value.
    pub fn push_await(&self) -> (AwaitToken, oneshot::Receiver<T>) {
        let token = AwaitToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        lock(&self.awaits).push((token, tx));
        (token, rx)
    }

    /// Take the most recently registered live waiter.
    pub fn pop_await(&self) -> Option<oneshot::Sender<T>> {
        let mut awaits = lock(&self.awaits);
        while let Some((_, tx)) = awaits.pop() {
            if !tx.is_closed() {
                return Some(tx);
            }
        }
        None
    }

    /// Deliver `value` to the most recent live waiter. Gives the value back
    /// when no waiter takes it.
    pub fn resolve_await(&self, mut value: T) -> Result<(), T> {
        while let Some(waiter) = self.pop_await() {
            match waiter.send(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }
        }
        Err(value)
    }

    /// Withdraw a waiter that gave up.
    pub fn cancel_await(&self, token: AwaitToken) {
        lock(&self.awaits).retain(|(t, _)| *t != token);
    }

    /// Register a waiter for the response to `correlation_id`.
    pub fn register_request(&self, correlation_id: Uuid) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        lock(&self.requests).insert(correlation_id, tx);
        rx
    }

    /// Take the waiter for `correlation_id`, if one is still registered.
    pub fn take_request(&self, correlation_id: Uuid) -> Option<oneshot::Sender<Response>> {
        lock(&self.requests).remove(&correlation_id)
    }

    pub fn cancel_request(&self, correlation_id: Uuid) {
        lock(&self.requests).remove(&correlation_id);
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending_awaits() || !lock(&self.requests).is_empty()
    }

    pub fn has_pending_awaits(&self) -> bool {
        lock(&self.awaits).iter().any(|(_, tx)| !tx.is_closed())
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Drop every waiter. Blocked callers observe an empty result at once.
    pub fn clear(&self) {
        lock(&self.awaits).clear();
        lock(&self.requests).clear();
    }
}

impl<T> Default for CorrelationStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
