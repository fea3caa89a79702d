//! Transactional cache overlays.
//!
//! An overlay lets mailbox operations treat a shared, cluster-visible
//! collection as a plain in-memory collection within one transaction.
//! Mutations go to a per-thread working copy immediately (same-thread reads
//! observe them) and are buffered as [`Change`] records; nothing reaches the
//! authoritative backing store until [`TransactionTracker::commit_cache`]
//! replays the buffer. [`TransactionTracker::rollback_cache`] discards the
//! working copies without replaying anything.

mod backing;
mod lru;
mod map;
mod set;

pub use backing::{
    MemoryMapBacking, MemorySetBacking, SharedHashMapBacking, SharedHashSetBacking,
};
pub use lru::{DropOldest, EvictionStrategy, LruBacking, LruOverlay};
pub use map::{MapBacking, MapOverlay};
pub use set::{SetBacking, SetOverlay};

use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{error, warn};

/// One buffered mutation on a transactional overlay.
///
/// Map overlays record `Put`/`PutAll`/`Remove`/`Clear`; set overlays record
/// `Add`/`AddAll`/`Remove`/`RemoveAll`/`RetainAll`/`Clear` with `V = ()`;
/// the LRU overlay records `MarkAccessed`/`Remove`/`Clear`.
#[derive(Clone, PartialEq, Eq)]
pub enum Change<K, V> {
    /// Insert or replace one entry.
    Put {
        /// Entry key.
        key: K,
        /// Entry value.
        value: V,
    },
    /// Insert or replace a batch of entries.
    PutAll {
        /// The entries, in insertion order.
        entries: Vec<(K, V)>,
    },
    /// Remove one entry or member.
    Remove {
        /// The key or member to remove.
        key: K,
    },
    /// Remove everything.
    Clear,
    /// Add one member.
    Add {
        /// The member to add.
        member: K,
    },
    /// Add a batch of members.
    AddAll {
        /// The members to add.
        members: Vec<K>,
    },
    /// Remove a batch of members.
    RemoveAll {
        /// The members to remove.
        members: Vec<K>,
    },
    /// Keep only the listed members.
    RetainAll {
        /// The members to retain.
        members: Vec<K>,
    },
    /// Move a key to the most-recently-used position.
    MarkAccessed {
        /// The accessed key.
        key: K,
    },
}

// Variant label only; keys and values are not required to be Debug.
impl<K, V> std::fmt::Debug for Change<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Change::Put { .. } => "Put",
            Change::PutAll { .. } => "PutAll",
            Change::Remove { .. } => "Remove",
            Change::Clear => "Clear",
            Change::Add { .. } => "Add",
            Change::AddAll { .. } => "AddAll",
            Change::RemoveAll { .. } => "RemoveAll",
            Change::RetainAll { .. } => "RetainAll",
            Change::MarkAccessed { .. } => "MarkAccessed",
        };
        f.write_str(label)
    }
}

/// Per-thread working copy of one overlay, plus its buffered change log.
pub(crate) struct Working<C, K, V> {
    pub(crate) data: C,
    pub(crate) changes: Vec<Change<K, V>>,
}

impl<C, K, V> Working<C, K, V> {
    pub(crate) fn new(data: C) -> Self {
        Self {
            data,
            changes: Vec::new(),
        }
    }
}

/// An overlay instance as seen by the [`TransactionTracker`].
pub trait OverlayParticipant: Send + Sync {
    /// Overlay name, for diagnostics.
    fn name(&self) -> &str;

    /// True if the calling thread has buffered changes.
    fn has_changes(&self) -> bool;

    /// Replays the calling thread's buffered changes into the backing store.
    ///
    /// # Errors
    ///
    /// Returns the first backing-store error; the tracker logs it and keeps
    /// going, since the overlay is a best-effort secondary cache.
    fn flush_changes(&self) -> CoreResult<()>;

    /// Drops the calling thread's working copy and change log; the next read
    /// re-pulls from the backing store.
    fn clear_local(&self);
}

/// Tracks which overlay instances the current thread's transaction touched.
///
/// One tracker serves a whole process; working copies and change logs are
/// keyed by thread, so concurrent transactions on different mailboxes never
/// observe each other.
#[derive(Default)]
pub struct TransactionTracker {
    touched: Mutex<HashMap<ThreadId, Vec<Arc<dyn OverlayParticipant>>>>,
}

impl TransactionTracker {
    /// Creates a tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an overlay as touched by the calling thread's transaction.
    ///
    /// Called by overlays on first access per thread per transaction.
    pub fn register(&self, overlay: Arc<dyn OverlayParticipant>) {
        let mut touched = self.touched.lock();
        let list = touched.entry(thread::current().id()).or_default();
        if !list.iter().any(|o| Arc::ptr_eq(o, &overlay)) {
            list.push(overlay);
        }
    }

    /// Marks the start of a transaction on the calling thread.
    ///
    /// Unflushed changes left by the previous transaction indicate a bug in
    /// its commit/rollback pairing; they are logged and every stale working
    /// copy is dropped unconditionally, forcing a fresh pull.
    pub fn transaction_begin(&self) {
        let leftovers = self.touched.lock().remove(&thread::current().id());
        let Some(overlays) = leftovers else { return };
        for overlay in &overlays {
            if overlay.has_changes() {
                warn!(
                    "transaction began with unflushed changes in overlay '{}'; \
                     previous transaction missed commit/rollback",
                    overlay.name()
                );
            }
            overlay.clear_local();
        }
    }

    /// Commits the calling thread's transaction: every touched overlay
    /// replays its change buffer into the authoritative store, then drops its
    /// working copy.
    ///
    /// Backing-store failures are logged and do not abort the commit; the
    /// overlay layer is a secondary cache and the next cold read re-pulls
    /// authoritative state.
    pub fn commit_cache(&self) {
        let overlays = self
            .touched
            .lock()
            .remove(&thread::current().id())
            .unwrap_or_default();
        for overlay in &overlays {
            if let Err(e) = overlay.flush_changes() {
                error!(
                    "failed to flush overlay '{}' on commit, cache will repull: {e}",
                    overlay.name()
                );
            }
            overlay.clear_local();
        }
    }

    /// Rolls back the calling thread's transaction: every touched overlay
    /// drops its working copy without replaying any change.
    pub fn rollback_cache(&self) {
        let overlays = self
            .touched
            .lock()
            .remove(&thread::current().id())
            .unwrap_or_default();
        for overlay in &overlays {
            overlay.clear_local();
        }
    }

    /// Number of overlays the calling thread's transaction has touched.
    #[must_use]
    pub fn touched_count(&self) -> usize {
        self.touched
            .lock()
            .get(&thread::current().id())
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for TransactionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTracker")
            .field("threads", &self.touched.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeOverlay {
        name: String,
        dirty: Mutex<bool>,
        flushes: AtomicUsize,
        clears: AtomicUsize,
    }

    impl FakeOverlay {
        fn new(name: &str, dirty: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                dirty: Mutex::new(dirty),
                flushes: AtomicUsize::new(0),
                clears: AtomicUsize::new(0),
            })
        }
    }

    impl OverlayParticipant for FakeOverlay {
        fn name(&self) -> &str {
            &self.name
        }
        fn has_changes(&self) -> bool {
            *self.dirty.lock()
        }
        fn flush_changes(&self) -> CoreResult<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            *self.dirty.lock() = false;
            Ok(())
        }
        fn clear_local(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
            *self.dirty.lock() = false;
        }
    }

    #[test]
    fn register_dedupes_by_instance() {
        let tracker = TransactionTracker::new();
        let overlay = FakeOverlay::new("items", false);
        tracker.register(Arc::clone(&overlay) as Arc<dyn OverlayParticipant>);
        tracker.register(overlay as Arc<dyn OverlayParticipant>);
        assert_eq!(tracker.touched_count(), 1);
    }

    #[test]
    fn commit_flushes_then_clears() {
        let tracker = TransactionTracker::new();
        let overlay = FakeOverlay::new("items", true);
        tracker.register(Arc::clone(&overlay) as Arc<dyn OverlayParticipant>);

        tracker.commit_cache();

        assert_eq!(overlay.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(overlay.clears.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.touched_count(), 0);
    }

    #[test]
    fn rollback_clears_without_flushing() {
        let tracker = TransactionTracker::new();
        let overlay = FakeOverlay::new("items", true);
        tracker.register(Arc::clone(&overlay) as Arc<dyn OverlayParticipant>);

        tracker.rollback_cache();

        assert_eq!(overlay.flushes.load(Ordering::SeqCst), 0);
        assert_eq!(overlay.clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn begin_clears_leftovers_from_leaked_transaction() {
        let tracker = TransactionTracker::new();
        let overlay = FakeOverlay::new("items", true);
        tracker.register(Arc::clone(&overlay) as Arc<dyn OverlayParticipant>);

        // No commit/rollback happened; the next transaction must start clean.
        tracker.transaction_begin();

        assert_eq!(overlay.flushes.load(Ordering::SeqCst), 0);
        assert_eq!(overlay.clears.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.touched_count(), 0);
    }

    #[test]
    fn tracking_is_per_thread() {
        let tracker = Arc::new(TransactionTracker::new());
        let overlay = FakeOverlay::new("items", false);
        tracker.register(overlay as Arc<dyn OverlayParticipant>);

        let tracker2 = Arc::clone(&tracker);
        std::thread::spawn(move || {
            assert_eq!(tracker2.touched_count(), 0);
        })
        .join()
        .unwrap();

        assert_eq!(tracker.touched_count(), 1);
    }
}
