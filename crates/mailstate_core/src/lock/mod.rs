//! Mailbox locking.
//!
//! One reentrant read/write lock per mailbox key. `acquire` blocks the
//! calling thread, bounded by the configured wait timeout and waiter count;
//! both bounds surface as distinguished errors rather than being retried.
//! In cluster mode the write path additionally holds the backend's
//! distributed mutex, making the write lock exclusive cluster-wide.
//!
//! Read locks serialize node-locally only. Field reads reconcile against the
//! shared backend on every access, so a cross-node read-during-write race
//! degrades to the same eventual-consistency window the backend already
//! imposes; serializing readers cluster-wide would add a backend round trip
//! to every read transaction for no stronger guarantee.

pub mod maintenance;

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::MailboxId;
use mailstate_backend::{MutexHandle, MutexMode, SharedStateBackend};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: u32,
    readers: HashMap<ThreadId, u32>,
    waiters: usize,
}

impl LockState {
    fn write_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    fn read_free(&self) -> bool {
        self.writer.is_none()
    }
}

#[derive(Default)]
struct LockEntry {
    state: Mutex<LockState>,
    cond: Condvar,
}

/// Factory and registry for per-mailbox locks.
///
/// Constructed once per process and injected wherever locking is needed. In
/// cluster mode construction fails fast if the backend is unreachable:
/// running without cross-node mutual exclusion risks silent state
/// corruption, so callers treat that error as fatal rather than degrading to
/// local-only locking.
pub struct LockManager {
    backend: Option<Arc<dyn SharedStateBackend>>,
    timeout: Duration,
    max_waiters: usize,
    entries: Mutex<HashMap<MailboxId, Arc<LockEntry>>>,
}

impl LockManager {
    /// Creates a local-only lock manager.
    #[must_use]
    pub fn local(config: &StoreConfig) -> Self {
        Self {
            backend: None,
            timeout: config.lock_timeout,
            max_waiters: config.max_lock_waiters,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a cluster-mode lock manager.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ClusterUnavailable`] if the backend does not
    /// answer a liveness check; callers must not fall back to local-only
    /// locking.
    pub fn clustered(
        config: &StoreConfig,
        backend: Arc<dyn SharedStateBackend>,
    ) -> CoreResult<Self> {
        if let Err(e) = backend.ping() {
            return Err(CoreError::cluster_unavailable(e.to_string()));
        }
        info!("cluster lock manager attached to shared backend");
        Ok(Self {
            backend: Some(backend),
            timeout: config.lock_timeout,
            max_waiters: config.max_lock_waiters,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// True if this manager coordinates through a shared backend.
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.backend.is_some()
    }

    fn entry(&self, mailbox_id: MailboxId) -> Arc<LockEntry> {
        Arc::clone(
            self.entries
                .lock()
                .entry(mailbox_id)
                .or_insert_with(|| Arc::new(LockEntry::default())),
        )
    }

    fn mutex_name(mailbox_id: MailboxId) -> String {
        format!("lock:{}", mailbox_id.as_u64())
    }

    /// Acquires the mailbox lock, blocking until granted or the wait bound
    /// is hit. Reentrant: a thread already holding the lock gets its hold
    /// count incremented. Upgrading a read hold to a write hold is not
    /// supported.
    ///
    /// # Errors
    ///
    /// - [`CoreError::LockTimeout`] if the wait bound elapsed (including a
    ///   timed-out distributed mutex in cluster mode)
    /// - [`CoreError::LockQueueFull`] if too many threads are already queued
    /// - [`CoreError::InvalidOperation`] on a read-to-write upgrade attempt
    pub fn acquire(&self, mailbox_id: MailboxId, write: bool) -> CoreResult<LockGuard> {
        let entry = self.entry(mailbox_id);
        let me = thread::current().id();
        let mode = if write { "write" } else { "read" };
        let mut first_write_hold = false;

        {
            let mut state = entry.state.lock();
            if write {
                if state.writer == Some(me) {
                    state.write_holds += 1;
                } else if state.readers.contains_key(&me) {
                    return Err(CoreError::invalid_operation(
                        "cannot upgrade a read lock to a write lock",
                    ));
                } else {
                    self.wait_for(&entry, &mut state, mailbox_id, mode, LockState::write_free)?;
                    state.writer = Some(me);
                    state.write_holds = 1;
                    first_write_hold = true;
                }
            } else if state.writer == Some(me) || state.readers.contains_key(&me) {
                *state.readers.entry(me).or_insert(0) += 1;
            } else {
                self.wait_for(&entry, &mut state, mailbox_id, mode, LockState::read_free)?;
                state.readers.insert(me, 1);
            }
        }

        // The distributed mutex is held once, by the outermost write guard.
        let mut dist_handle = None;
        if first_write_hold {
            if let Some(backend) = &self.backend {
                match backend.mutex_acquire(
                    &Self::mutex_name(mailbox_id),
                    MutexMode::Exclusive,
                    self.timeout,
                ) {
                    Ok(handle) => dist_handle = Some(handle),
                    Err(e) => {
                        let mut state = entry.state.lock();
                        state.writer = None;
                        state.write_holds = 0;
                        drop(state);
                        entry.cond.notify_all();
                        return Err(match e {
                            mailstate_backend::BackendError::MutexTimeout { .. } => {
                                CoreError::LockTimeout { mailbox_id, mode }
                            }
                            other => CoreError::Backend(other),
                        });
                    }
                }
            }
        }

        Ok(LockGuard {
            entry,
            mailbox_id,
            write,
            backend: self.backend.clone(),
            dist_handle,
            released: false,
            _not_send: PhantomData,
        })
    }

    fn wait_for(
        &self,
        entry: &LockEntry,
        state: &mut parking_lot::MutexGuard<'_, LockState>,
        mailbox_id: MailboxId,
        mode: &'static str,
        free: fn(&LockState) -> bool,
    ) -> CoreResult<()> {
        if free(state) {
            return Ok(());
        }
        if state.waiters >= self.max_waiters {
            return Err(CoreError::LockQueueFull {
                mailbox_id,
                waiters: state.waiters,
            });
        }
        state.waiters += 1;
        let deadline = Instant::now() + self.timeout;
        while !free(state) {
            if entry.cond.wait_until(state, deadline).timed_out() {
                state.waiters -= 1;
                return Err(CoreError::LockTimeout { mailbox_id, mode });
            }
        }
        state.waiters -= 1;
        Ok(())
    }

    /// True if no thread holds the mailbox lock in any mode.
    #[must_use]
    pub fn is_unlocked(&self, mailbox_id: MailboxId) -> bool {
        let entry = self.entry(mailbox_id);
        let state = entry.state.lock();
        state.writer.is_none() && state.readers.is_empty()
    }

    /// Total holds the calling thread has on the mailbox lock.
    #[must_use]
    pub fn hold_count(&self, mailbox_id: MailboxId) -> u32 {
        let entry = self.entry(mailbox_id);
        let state = entry.state.lock();
        let me = thread::current().id();
        let writes = if state.writer == Some(me) {
            state.write_holds
        } else {
            0
        };
        writes + state.readers.get(&me).copied().unwrap_or(0)
    }

    /// True if the calling thread holds the write lock.
    #[must_use]
    pub fn is_write_locked_by_current_thread(&self, mailbox_id: MailboxId) -> bool {
        let entry = self.entry(mailbox_id);
        let held = entry.state.lock().writer == Some(thread::current().id());
        held
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("clustered", &self.is_clustered())
            .field("mailboxes", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

/// One hold on a mailbox lock.
///
/// Releases on drop; guards must be released by the thread that acquired
/// them, in reverse acquisition order, and are therefore not `Send`.
pub struct LockGuard {
    entry: Arc<LockEntry>,
    mailbox_id: MailboxId,
    write: bool,
    backend: Option<Arc<dyn SharedStateBackend>>,
    dist_handle: Option<MutexHandle>,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl LockGuard {
    /// The locked mailbox.
    #[must_use]
    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox_id
    }

    /// True if this is a write hold.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Releases the hold explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let me = thread::current().id();
        {
            let mut state = self.entry.state.lock();
            if self.write {
                state.write_holds = state.write_holds.saturating_sub(1);
                if state.write_holds == 0 {
                    state.writer = None;
                }
            } else if let Some(count) = state.readers.get_mut(&me) {
                *count -= 1;
                if *count == 0 {
                    state.readers.remove(&me);
                }
            }
        }
        self.entry.cond.notify_all();
        if let Some(handle) = self.dist_handle.take() {
            if let Some(backend) = &self.backend {
                if let Err(e) = backend.mutex_release(&handle) {
                    error!(
                        "failed to release distributed mutex for {}: {e}",
                        self.mailbox_id
                    );
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("mailbox_id", &self.mailbox_id)
            .field("write", &self.write)
            .field("distributed", &self.dist_handle.is_some())
            .finish_non_exhaustive()
    }
}
