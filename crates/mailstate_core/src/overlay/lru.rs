//! LRU transactional overlay for the item cache.

use crate::error::CoreResult;
use crate::overlay::{Change, OverlayParticipant, TransactionTracker, Working};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Picks eviction victims for a trim pass.
///
/// `candidates` is the full access order, least-recently-used first, and
/// `excess` is how many entries must go to reach the target size. Strategies
/// may return fewer victims (pinned entries stay cached) but never more.
pub trait EvictionStrategy<K>: Send + Sync {
    /// Selects which keys to evict.
    fn select(&self, candidates: &[K], excess: usize) -> Vec<K>;
}

/// The default strategy: evict strictly in access order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropOldest;

impl<K: Clone> EvictionStrategy<K> for DropOldest {
    fn select(&self, candidates: &[K], excess: usize) -> Vec<K> {
        candidates.iter().take(excess).cloned().collect()
    }
}

/// Authoritative access-order store behind an [`LruOverlay`].
pub trait LruBacking<K>: Send + Sync {
    /// Pulls the full access order, least-recently-used first.
    fn load(&self) -> CoreResult<Vec<K>>;

    /// Applies one committed change.
    fn apply(&self, change: &Change<K, ()>) -> CoreResult<()>;
}

/// Access-order view of a shared LRU cache, with per-thread buffering.
///
/// `mark_accessed` and `remove` mutate the calling thread's working order
/// immediately and buffer the change; `trim` selects victims from the
/// working order via the supplied [`EvictionStrategy`] and buffers their
/// removal, returning the evicted keys to the caller.
pub struct LruOverlay<K> {
    name: String,
    backing: Arc<dyn LruBacking<K>>,
    tracker: Arc<TransactionTracker>,
    local: Mutex<HashMap<ThreadId, Working<Vec<K>, K, ()>>>,
    weak_self: Weak<LruOverlay<K>>,
}

impl<K> LruOverlay<K>
where
    K: Eq + Clone + Send + Sync + 'static,
{
    /// Creates an overlay over `backing`, registering with `tracker` on
    /// first use per transaction.
    pub fn new(
        name: impl Into<String>,
        backing: Arc<dyn LruBacking<K>>,
        tracker: Arc<TransactionTracker>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak_self| Self {
            name,
            backing,
            tracker,
            local: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    fn with_working<R>(&self, f: impl FnOnce(&mut Working<Vec<K>, K, ()>) -> R) -> CoreResult<R> {
        let tid = thread::current().id();
        let mut local = self.local.lock();
        if !local.contains_key(&tid) {
            let data = self.backing.load()?;
            local.insert(tid, Working::new(data));
            if let Some(me) = self.weak_self.upgrade() {
                self.tracker.register(me);
            }
        }
        let working = local
            .get_mut(&tid)
            .unwrap_or_else(|| unreachable!("working copy inserted above"));
        Ok(f(working))
    }

    /// Moves a key to the most-recently-used position, adding it if absent.
    pub fn mark_accessed(&self, key: K) -> CoreResult<()> {
        self.with_working(|w| {
            w.data.retain(|k| k != &key);
            w.data.push(key.clone());
            w.changes.push(Change::MarkAccessed { key });
        })
    }

    /// Removes a key from the access order; returns true if it was present.
    pub fn remove(&self, key: &K) -> CoreResult<bool> {
        self.with_working(|w| {
            let before = w.data.len();
            w.data.retain(|k| k != key);
            w.changes.push(Change::Remove { key: key.clone() });
            w.data.len() != before
        })
    }

    /// True if the key is in the working access order.
    pub fn contains(&self, key: &K) -> CoreResult<bool> {
        self.with_working(|w| w.data.contains(key))
    }

    /// Number of tracked keys in the working copy.
    pub fn len(&self) -> CoreResult<usize> {
        self.with_working(|w| w.data.len())
    }

    /// True if no keys are tracked.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.with_working(|w| w.data.is_empty())
    }

    /// The working access order, least-recently-used first.
    pub fn access_order(&self) -> CoreResult<Vec<K>> {
        self.with_working(|w| w.data.clone())
    }

    /// Shrinks the cache to at most `max` entries.
    ///
    /// Victim selection is delegated to `strategy`; the evicted keys are
    /// removed from the working order, buffered as removals, and returned.
    pub fn trim(&self, max: usize, strategy: &dyn EvictionStrategy<K>) -> CoreResult<Vec<K>> {
        self.with_working(|w| {
            let excess = w.data.len().saturating_sub(max);
            if excess == 0 {
                return Vec::new();
            }
            let victims = strategy.select(&w.data, excess);
            for victim in &victims {
                w.data.retain(|k| k != victim);
                w.changes.push(Change::Remove {
                    key: victim.clone(),
                });
            }
            victims
        })
    }
}

impl<K> OverlayParticipant for LruOverlay<K>
where
    K: Eq + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn has_changes(&self) -> bool {
        self.local
            .lock()
            .get(&thread::current().id())
            .is_some_and(|w| !w.changes.is_empty())
    }

    fn flush_changes(&self) -> CoreResult<()> {
        let changes = self
            .local
            .lock()
            .get_mut(&thread::current().id())
            .map(|w| std::mem::take(&mut w.changes))
            .unwrap_or_default();
        for change in &changes {
            self.backing.apply(change)?;
        }
        Ok(())
    }

    fn clear_local(&self) {
        self.local.lock().remove(&thread::current().id());
    }
}

impl<K> std::fmt::Debug for LruOverlay<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruOverlay")
            .field("name", &self.name)
            .field("threads", &self.local.lock().len())
            .finish_non_exhaustive()
    }
}
