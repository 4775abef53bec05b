use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{TransportError, TransportResult};
use crate::promise::TransportPromise;
use crate::transport::Transport;

#[derive(Default)]
struct Registries {
    pending: HashMap<String, TransportPromise>,
    active: HashMap<String, Arc<Transport>>,
    closed: bool,
}

/// Pending and active transports keyed by stream identifier. A stream
/// identifier is present in at most one of the two maps at any instant.
/// The lock is only held across map operations.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<Registries>,
}

impl Registry {
    pub(crate) fn register_pending(&self, promise: &TransportPromise) -> TransportResult<()> {
        let mut guard = self.inner.lock();
        if guard.closed {
            return Err(TransportError::FactoryClosed);
        }
        let stream_id = promise.stream_id();
        if guard.active.contains_key(stream_id) || guard.pending.contains_key(stream_id) {
            return Err(TransportError::DuplicateTransport {
                stream_id: stream_id.to_string(),
            });
        }
        guard.pending.insert(stream_id.to_string(), promise.clone());
        Ok(())
    }

    /// Settles `promise` and, if that settlement won, moves its identifier
    /// out of the pending map and, on success, into the active map, all under
    /// one lock acquisition.
    pub(crate) fn settle(
        &self,
        promise: &TransportPromise,
        outcome: TransportResult<Arc<Transport>>,
    ) -> TransportResult<()> {
        let mut guard = self.inner.lock();
        let transport = outcome.as_ref().ok().cloned();
        promise.settle(outcome)?;
        remove_pending_locked(&mut guard, promise);
        if let Some(transport) = transport {
            guard
                .active
                .insert(promise.stream_id().to_string(), transport);
        }
        Ok(())
    }

    pub(crate) fn remove_pending(&self, promise: &TransportPromise) -> bool {
        remove_pending_locked(&mut self.inner.lock(), promise)
    }

    pub(crate) fn remove_active(&self, transport: &Arc<Transport>) -> bool {
        let mut guard = self.inner.lock();
        let owned = guard
            .active
            .get(transport.stream_id())
            .is_some_and(|current| Arc::ptr_eq(current, transport));
        if owned {
            guard.active.remove(transport.stream_id());
        }
        owned
    }

    pub(crate) fn pending(&self, stream_id: &str) -> Option<TransportPromise> {
        self.inner.lock().pending.get(stream_id).cloned()
    }

    pub(crate) fn active(&self, stream_id: &str) -> Option<Arc<Transport>> {
        self.inner.lock().active.get(stream_id).cloned()
    }

    pub(crate) fn pending_promises(&self) -> Vec<TransportPromise> {
        self.inner.lock().pending.values().cloned().collect()
    }

    pub(crate) fn drain_active(&self) -> Vec<Arc<Transport>> {
        self.inner
            .lock()
            .active
            .drain()
            .map(|(_, transport)| transport)
            .collect()
    }

    pub(crate) fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Rejects every later registration with [`TransportError::FactoryClosed`].
    pub(crate) fn close(&self) {
        self.inner.lock().closed = true;
    }
}

fn remove_pending_locked(guard: &mut Registries, promise: &TransportPromise) -> bool {
    let owned = guard
        .pending
        .get(promise.stream_id())
        .is_some_and(|current| current.ptr_eq(promise));
    if owned {
        guard.pending.remove(promise.stream_id());
    }
    owned
}
