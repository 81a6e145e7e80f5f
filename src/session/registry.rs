//! Pending synchronous calls, keyed by correlation key.
//!
//! At most one wait exists per key. The dispatcher resolves a wait by
//! removing it from the map and then handing the response over, so a
//! response is delivered at most once. A wait that times out, or whose handle
//! is dropped, removes itself; registration ids keep a stale handle from
//! removing a newer wait for the same key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::envelope::{CorrelationKey, Response};

use super::ClientError;

struct Slot {
    id: u64,
    tx: oneshot::Sender<Response>,
}

/// Concurrent map of pending waits. Owned by one session.
#[derive(Default)]
pub struct CorrelationRegistry {
    slots: DashMap<CorrelationKey, Slot>,
    next_id: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for `key`.
    ///
    /// Fails with `AlreadyPending` if a wait for `key` is outstanding.
    pub fn register(self: &Arc<Self>, key: CorrelationKey) -> Result<WaitHandle, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.slots.entry(key) {
            Entry::Occupied(_) => return Err(ClientError::AlreadyPending { key }),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { id, tx });
            }
        }

        trace!(key = %key, id, "Registered pending wait");

        Ok(WaitHandle {
            key,
            id,
            rx: Some(rx),
            registry: Arc::clone(self),
        })
    }

    /// Hand `response` to the wait registered for `key`.
    ///
    /// Returns whether a waiter received it. Safe to call when nothing is
    /// registered.
    pub fn resolve(&self, key: CorrelationKey, response: Response) -> bool {
        match self.slots.remove(&key) {
            Some((_, slot)) => {
                let delivered = slot.tx.send(response).is_ok();
                debug!(key = %key, delivered, "Resolved pending wait");
                delivered
            }
            None => false,
        }
    }

    /// Whether a wait is outstanding for `key`.
    pub fn is_pending(&self, key: CorrelationKey) -> bool {
        self.slots.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every pending wait. Waiters observe `ClientError::Closed`.
    pub fn clear(&self) {
        let pending = self.slots.len();
        self.slots.clear();
        if pending > 0 {
            debug!(pending, "Cleared pending waits");
        }
    }

    fn deregister(&self, key: CorrelationKey, id: u64) {
        if self.slots.remove_if(&key, |_, slot| slot.id == id).is_some() {
            trace!(key = %key, id, "Deregistered pending wait");
        }
    }
}

/// A caller's claim on the next response for its key.
///
/// Dropping the handle deregisters the wait.
pub struct WaitHandle {
    key: CorrelationKey,
    id: u64,
    rx: Option<oneshot::Receiver<Response>>,
    registry: Arc<CorrelationRegistry>,
}

impl WaitHandle {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Wait for the response or the deadline, whichever comes first.
    ///
    /// On timeout the wait is deregistered before returning, so the key can
    /// be registered again immediately.
    pub async fn wait(mut self, timeout: Duration) -> Result<Response, ClientError> {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(ClientError::Closed),
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.registry.deregister(self.key, self.id);
                Err(ClientError::Timeout {
                    key: self.key,
                    after: timeout,
                })
            }
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.registry.deregister(self.key, self.id);
    }
}
