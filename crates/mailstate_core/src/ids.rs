//! Distributed monotonic ID allocation.

use crate::error::{CoreError, CoreResult};
use crate::types::{CounterKind, MailboxId};
use mailstate_backend::SharedStateBackend;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Monotonic counters scoped to one mailbox.
///
/// Three named counters per mailbox (item, search, change). Increments are
/// atomic and never lose updates; `set_if_not_exists` initializes-or-reads
/// in one atomic backend operation so racing nodes always converge on a
/// single origin value.
pub trait IdAllocator: Send + Sync {
    /// Reads the current counter value.
    fn value(&self, kind: CounterKind) -> CoreResult<u64>;

    /// Atomically adds `delta` (> 0) and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for a zero delta.
    fn increment(&self, kind: CounterKind, delta: u64) -> CoreResult<u64>;

    /// Atomically initializes the counter to `value` if it does not exist,
    /// or reads the existing value. All callers receive the same result.
    fn set_if_not_exists(&self, kind: CounterKind, value: u64) -> CoreResult<u64>;
}

fn check_delta(delta: u64) -> CoreResult<()> {
    if delta == 0 {
        return Err(CoreError::invalid_operation(
            "counter increment delta must be positive",
        ));
    }
    Ok(())
}

/// In-process allocator for local-only deployments.
///
/// Same contract as the shared allocator, backed by plain process memory.
#[derive(Debug, Default)]
pub struct LocalIdAllocator {
    counters: Mutex<HashMap<CounterKind, u64>>,
}

impl LocalIdAllocator {
    /// Creates an allocator with all counters absent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdAllocator for LocalIdAllocator {
    fn value(&self, kind: CounterKind) -> CoreResult<u64> {
        Ok(self.counters.lock().get(&kind).copied().unwrap_or(0))
    }

    fn increment(&self, kind: CounterKind, delta: u64) -> CoreResult<u64> {
        check_delta(delta)?;
        let mut counters = self.counters.lock();
        let value = counters.entry(kind).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    fn set_if_not_exists(&self, kind: CounterKind, value: u64) -> CoreResult<u64> {
        Ok(*self.counters.lock().entry(kind).or_insert(value))
    }
}

/// Cluster allocator backed by the shared backend's atomic counters.
pub struct SharedIdAllocator {
    backend: Arc<dyn SharedStateBackend>,
    mailbox_id: MailboxId,
}

impl SharedIdAllocator {
    /// Creates an allocator for one mailbox.
    pub fn new(backend: Arc<dyn SharedStateBackend>, mailbox_id: MailboxId) -> Self {
        Self {
            backend,
            mailbox_id,
        }
    }

    fn key(&self, kind: CounterKind) -> String {
        format!("counter:{}:{}", self.mailbox_id.as_u64(), kind.as_str())
    }
}

impl IdAllocator for SharedIdAllocator {
    fn value(&self, kind: CounterKind) -> CoreResult<u64> {
        let value = self.backend.counter_get(&self.key(kind))?;
        Ok(value.max(0) as u64)
    }

    fn increment(&self, kind: CounterKind, delta: u64) -> CoreResult<u64> {
        check_delta(delta)?;
        let value = self.backend.counter_add(&self.key(kind), delta as i64)?;
        Ok(value.max(0) as u64)
    }

    fn set_if_not_exists(&self, kind: CounterKind, value: u64) -> CoreResult<u64> {
        let stored = self.backend.check_and_init(&self.key(kind), value as i64)?;
        Ok(stored.max(0) as u64)
    }
}

impl std::fmt::Debug for SharedIdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedIdAllocator")
            .field("mailbox_id", &self.mailbox_id)
            .finish_non_exhaustive()
    }
}
