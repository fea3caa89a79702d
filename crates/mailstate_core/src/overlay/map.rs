//! Map-shaped transactional overlay.

use crate::error::CoreResult;
use crate::overlay::{Change, OverlayParticipant, TransactionTracker, Working};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Authoritative store behind a [`MapOverlay`].
pub trait MapBacking<K, V>: Send + Sync {
    /// Pulls the full authoritative map.
    fn load(&self) -> CoreResult<HashMap<K, V>>;

    /// Applies one committed change.
    fn apply(&self, change: &Change<K, V>) -> CoreResult<()>;
}

/// A shared map with per-thread buffered mutations.
///
/// Reads and writes address the calling thread's working copy, pulled
/// lazily from the backing store on first access per transaction. Mutations
/// are buffered as [`Change`] records and only reach the backing store when
/// the tracker commits.
pub struct MapOverlay<K, V> {
    name: String,
    backing: Arc<dyn MapBacking<K, V>>,
    tracker: Arc<TransactionTracker>,
    local: Mutex<HashMap<ThreadId, Working<HashMap<K, V>, K, V>>>,
    weak_self: Weak<MapOverlay<K, V>>,
}

impl<K, V> MapOverlay<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an overlay over `backing`, registering with `tracker` on
    /// first use per transaction.
    pub fn new(
        name: impl Into<String>,
        backing: Arc<dyn MapBacking<K, V>>,
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

    fn with_working<R>(
        &self,
        f: impl FnOnce(&mut Working<HashMap<K, V>, K, V>) -> R,
    ) -> CoreResult<R> {
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

    /// Reads one entry through the working copy.
    pub fn get(&self, key: &K) -> CoreResult<Option<V>> {
        self.with_working(|w| w.data.get(key).cloned())
    }

    /// True if the key is present in the working copy.
    pub fn contains_key(&self, key: &K) -> CoreResult<bool> {
        self.with_working(|w| w.data.contains_key(key))
    }

    /// Number of entries in the working copy.
    pub fn len(&self) -> CoreResult<usize> {
        self.with_working(|w| w.data.len())
    }

    /// True if the working copy is empty.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.with_working(|w| w.data.is_empty())
    }

    /// Clones the full working copy.
    pub fn snapshot(&self) -> CoreResult<HashMap<K, V>> {
        self.with_working(|w| w.data.clone())
    }

    /// Inserts or replaces one entry, returning the previous value.
    pub fn put(&self, key: K, value: V) -> CoreResult<Option<V>> {
        self.with_working(|w| {
            let previous = w.data.insert(key.clone(), value.clone());
            w.changes.push(Change::Put { key, value });
            previous
        })
    }

    /// Inserts or replaces a batch of entries.
    pub fn put_all(&self, entries: Vec<(K, V)>) -> CoreResult<()> {
        self.with_working(|w| {
            for (key, value) in &entries {
                w.data.insert(key.clone(), value.clone());
            }
            w.changes.push(Change::PutAll { entries });
        })
    }

    /// Removes one entry, returning its value if present.
    pub fn remove(&self, key: &K) -> CoreResult<Option<V>> {
        self.with_working(|w| {
            let previous = w.data.remove(key);
            w.changes.push(Change::Remove { key: key.clone() });
            previous
        })
    }

    /// Removes every entry.
    pub fn clear(&self) -> CoreResult<()> {
        self.with_working(|w| {
            w.data.clear();
            w.changes.push(Change::Clear);
        })
    }
}

impl<K, V> OverlayParticipant for MapOverlay<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
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

impl<K, V> std::fmt::Debug for MapOverlay<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapOverlay")
            .field("name", &self.name)
            .field("threads", &self.local.lock().len())
            .finish_non_exhaustive()
    }
}
