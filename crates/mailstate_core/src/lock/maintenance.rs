//! Maintenance windows.
//!
//! A maintenance window gives a set of threads exclusive access to a mailbox
//! while it is being relocated or reloaded. Ordinary operations from threads
//! outside the allow-list fail with a distinguished error until the window
//! ends.

use crate::error::{CoreError, CoreResult};
use crate::state::MailboxState;
use crate::types::MailboxId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{info, warn};

struct Window {
    allowed: Vec<ThreadId>,
    nested_allowed: bool,
    inner_active: bool,
    cached_state: Option<Arc<MailboxState>>,
}

/// Registry of active maintenance windows, one per process.
#[derive(Default)]
pub struct MaintenanceWindows {
    windows: Mutex<HashMap<MailboxId, Window>>,
}

impl MaintenanceWindows {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a maintenance window on a mailbox.
    ///
    /// The allow-list is seeded with the calling thread. If a window is
    /// already active, a *nested* session starts instead - permitted only
    /// when the active window enabled nesting and the caller is on the
    /// allow-list; at most one nested session can be active.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MaintenanceAlreadyActive`] when nesting is not
    /// permitted for the caller.
    pub fn begin(&self, mailbox_id: MailboxId, nested_allowed: bool) -> CoreResult<()> {
        let me = thread::current().id();
        let mut windows = self.windows.lock();
        match windows.get_mut(&mailbox_id) {
            None => {
                info!("beginning maintenance on {mailbox_id}");
                windows.insert(
                    mailbox_id,
                    Window {
                        allowed: vec![me],
                        nested_allowed,
                        inner_active: false,
                        cached_state: None,
                    },
                );
                Ok(())
            }
            Some(window) => {
                if !window.nested_allowed {
                    return Err(CoreError::MaintenanceAlreadyActive {
                        mailbox_id,
                        message: "nested maintenance is not enabled".to_owned(),
                    });
                }
                if !window.allowed.contains(&me) {
                    return Err(CoreError::MaintenanceAlreadyActive {
                        mailbox_id,
                        message: "calling thread is not on the allow-list".to_owned(),
                    });
                }
                if window.inner_active {
                    return Err(CoreError::MaintenanceAlreadyActive {
                        mailbox_id,
                        message: "a nested maintenance session is already active".to_owned(),
                    });
                }
                info!("beginning nested maintenance on {mailbox_id}");
                window.inner_active = true;
                Ok(())
            }
        }
    }

    /// Adds a thread to an active window's allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if no window is active.
    pub fn register_thread(&self, mailbox_id: MailboxId, thread: ThreadId) -> CoreResult<()> {
        let mut windows = self.windows.lock();
        let window = windows.get_mut(&mailbox_id).ok_or_else(|| {
            CoreError::invalid_operation(format!("no maintenance window active on {mailbox_id}"))
        })?;
        if !window.allowed.contains(&thread) {
            window.allowed.push(thread);
        }
        Ok(())
    }

    /// Caches the mailbox state object protected by the window, so it can be
    /// detached when the window ends.
    pub fn cache_state(&self, mailbox_id: MailboxId, state: Arc<MailboxState>) {
        if let Some(window) = self.windows.lock().get_mut(&mailbox_id) {
            window.cached_state = Some(state);
        }
    }

    /// Ends the maintenance window.
    ///
    /// Clears the allow-list and the nested/inner flags and detaches the
    /// cached mailbox reference. With `success = false` the mailbox is
    /// additionally marked unavailable in the log; the caller is expected to
    /// force a reload before serving it again.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if no window is active.
    pub fn end(&self, mailbox_id: MailboxId, success: bool) -> CoreResult<()> {
        let window = self.windows.lock().remove(&mailbox_id).ok_or_else(|| {
            CoreError::invalid_operation(format!("no maintenance window active on {mailbox_id}"))
        })?;
        if let Some(state) = window.cached_state {
            state.detach_shared();
        }
        if success {
            info!("ending maintenance on {mailbox_id}");
        } else {
            warn!("ending maintenance on {mailbox_id} and marking it unavailable");
        }
        Ok(())
    }

    /// True if a window is active on the mailbox.
    #[must_use]
    pub fn is_active(&self, mailbox_id: MailboxId) -> bool {
        self.windows.lock().contains_key(&mailbox_id)
    }

    /// True if the calling thread may operate on the mailbox right now.
    #[must_use]
    pub fn can_access(&self, mailbox_id: MailboxId) -> bool {
        match self.windows.lock().get(&mailbox_id) {
            None => true,
            Some(window) => window.allowed.contains(&thread::current().id()),
        }
    }

    /// Fails with the maintenance error if the calling thread may not
    /// operate on the mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Maintenance`] for threads outside the
    /// allow-list of an active window.
    pub fn check(&self, mailbox_id: MailboxId) -> CoreResult<()> {
        if self.can_access(mailbox_id) {
            Ok(())
        } else {
            Err(CoreError::Maintenance { mailbox_id })
        }
    }
}

impl std::fmt::Debug for MaintenanceWindows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceWindows")
            .field("active", &self.windows.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MBOX: MailboxId = MailboxId::new(9);

    #[test]
    fn initiating_thread_keeps_access() {
        let windows = MaintenanceWindows::new();
        windows.begin(MBOX, false).unwrap();
        assert!(windows.is_active(MBOX));
        assert!(windows.can_access(MBOX));
        windows.check(MBOX).unwrap();
    }

    #[test]
    fn other_threads_get_the_maintenance_error() {
        let windows = Arc::new(MaintenanceWindows::new());
        windows.begin(MBOX, false).unwrap();

        let windows2 = Arc::clone(&windows);
        thread::spawn(move || {
            assert!(!windows2.can_access(MBOX));
            assert!(matches!(
                windows2.check(MBOX),
                Err(CoreError::Maintenance { .. })
            ));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn registered_threads_are_allowed() {
        let windows = Arc::new(MaintenanceWindows::new());
        windows.begin(MBOX, false).unwrap();

        let windows2 = Arc::clone(&windows);
        let worker = thread::spawn(move || {
            let me = thread::current().id();
            // Not yet registered.
            assert!(windows2.check(MBOX).is_err());
            windows2.register_thread(MBOX, me).unwrap();
            windows2.check(MBOX).unwrap();
        });
        worker.join().unwrap();
    }

    #[test]
    fn restart_without_nesting_fails() {
        let windows = MaintenanceWindows::new();
        windows.begin(MBOX, false).unwrap();
        assert!(matches!(
            windows.begin(MBOX, false),
            Err(CoreError::MaintenanceAlreadyActive { .. })
        ));
    }

    #[test]
    fn nested_start_requires_allow_listed_thread() {
        let windows = Arc::new(MaintenanceWindows::new());
        windows.begin(MBOX, true).unwrap();

        // Same thread, nesting enabled: allowed once.
        windows.begin(MBOX, true).unwrap();
        // A second nested session is rejected.
        assert!(matches!(
            windows.begin(MBOX, true),
            Err(CoreError::MaintenanceAlreadyActive { .. })
        ));

        // A foreign thread cannot nest even with nesting enabled.
        let fresh = Arc::new(MaintenanceWindows::new());
        fresh.begin(MBOX, true).unwrap();
        let fresh2 = Arc::clone(&fresh);
        thread::spawn(move || {
            assert!(matches!(
                fresh2.begin(MBOX, true),
                Err(CoreError::MaintenanceAlreadyActive { .. })
            ));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn end_clears_everything() {
        let windows = MaintenanceWindows::new();
        windows.begin(MBOX, true).unwrap();
        windows.begin(MBOX, true).unwrap();

        windows.end(MBOX, true).unwrap();
        assert!(!windows.is_active(MBOX));
        // A new window can start from scratch, without nesting.
        windows.begin(MBOX, false).unwrap();
    }

    #[test]
    fn end_without_window_is_an_error() {
        let windows = MaintenanceWindows::new();
        assert!(windows.end(MBOX, true).is_err());
    }

    #[test]
    fn end_detaches_cached_state() {
        let windows = MaintenanceWindows::new();
        windows.begin(MBOX, false).unwrap();

        let state = Arc::new(MailboxState::new(MBOX));
        let backend = Arc::new(mailstate_backend::MemoryBackend::new());
        state.attach_shared(crate::field::SharedStateAccessor::new(
            backend as Arc<dyn mailstate_backend::SharedStateBackend>,
            "mbox:9:state",
        ));
        windows.cache_state(MBOX, Arc::clone(&state));

        windows.end(MBOX, false).unwrap();
        assert!(!state.has_shared());
    }
}
