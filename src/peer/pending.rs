use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{CorrelationId, Result, RpcError};

/// What a waiting request eventually receives.
pub(crate) type Resolution = Result<Bytes>;

/// Receiving half handed to the caller of `register`.
pub(crate) type Waiter = oneshot::Receiver<Resolution>;

/// Acquire the table lock, intentionally ignoring poisoning.
///
/// The protected state is a map of independent waiters with no invariants
/// spanning entries; a panic elsewhere cannot leave it half-updated.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Table {
    // ---
    waiters: HashMap<CorrelationId, oneshot::Sender<Resolution>>,
    closed: bool,
}

/// Per-connection map from correlation id to in-flight waiter.
///
/// Every waiter is resolved at most once: whichever of `complete`, `fail`
/// or `fail_all` reaches it first removes it from the map, so later attempts
/// find nothing and are no-ops.
pub(crate) struct PendingRequests {
    // ---
    table: Mutex<Table>,
}

impl PendingRequests {
    // ---

    /// Create an empty, open table.
    pub fn new() -> Self {
        // ---
        Self {
            table: Mutex::new(Table {
                waiters: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a waiter for `id`. Must happen before the request frame is sent.
    ///
    /// # Errors
    ///
    /// - [`RpcError::ConnectionClosed`] once `fail_all` has run.
    /// - [`RpcError::DuplicateRequest`] if `id` is already pending.
    pub fn register(&self, id: CorrelationId) -> Result<Waiter> {
        // ---
        let mut table = lock_ignore_poison(&self.table);

        if table.closed {
            return Err(RpcError::ConnectionClosed);
        }
        if table.waiters.contains_key(&id) {
            return Err(RpcError::DuplicateRequest(id));
        }

        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Resolve `id` with a response payload.
    ///
    /// Returns `true` if a pending waiter was found.
    pub fn complete(&self, id: CorrelationId, payload: Bytes) -> bool {
        self.resolve(id, Ok(payload))
    }

    /// Resolve `id` with an error.
    ///
    /// Returns `true` if a pending waiter was found.
    pub fn fail(&self, id: CorrelationId, error: RpcError) -> bool {
        self.resolve(id, Err(error))
    }

    /// Resolve every pending waiter with `error` and refuse new registrations.
    ///
    /// Returns the number of waiters failed; a second call returns 0.
    pub fn fail_all(&self, error: RpcError) -> usize {
        // ---
        let drained: Vec<_> = {
            let mut table = lock_ignore_poison(&self.table);
            table.closed = true;
            table.waiters.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Remove a waiter without resolving it (used when the send itself failed).
    pub fn remove(&self, id: CorrelationId) -> bool {
        lock_ignore_poison(&self.table).waiters.remove(&id).is_some()
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.table).waiters.len()
    }

    fn resolve(&self, id: CorrelationId, resolution: Resolution) -> bool {
        // ---
        let tx = lock_ignore_poison(&self.table).waiters.remove(&id);

        match tx {
            Some(tx) => {
                // The caller may have given up already; that is not an error.
                let _ = tx.send(resolution);
                true
            }
            None => false,
        }
    }
}
