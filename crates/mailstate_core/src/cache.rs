//! Per-mailbox LRU cache of opaque item data.

use crate::error::CoreResult;
use crate::field::SharedStateAccessor;
use crate::overlay::{Change, DropOldest, EvictionStrategy, LruBacking};
use crate::state::ItemState;
use crate::types::{ItemId, MailboxId};
use mailstate_backend::SharedStateBackend;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The persistent home of item data, consumed as an opaque collaborator.
pub trait ItemDataStore: Send + Sync {
    /// Loads the raw data for an item, if it exists.
    fn load_item_data(&self, id: ItemId) -> CoreResult<Option<Vec<u8>>>;

    /// Saves the raw data for an item.
    fn save_item_data(&self, id: ItemId, raw: &[u8]) -> CoreResult<()>;
}

/// One cached item: its raw data plus its live state bundle.
pub struct CachedItem {
    /// Opaque item payload.
    pub raw: Vec<u8>,
    /// The item's synchronized state. Lives exactly as long as the cache
    /// entry.
    pub state: ItemState,
}

struct CacheInner {
    entries: HashMap<ItemId, CachedItem>,
    /// Access order, least-recently-used first.
    order: Vec<ItemId>,
}

impl CacheInner {
    fn touch(&mut self, id: ItemId) {
        self.order.retain(|k| *k != id);
        self.order.push(id);
    }

    fn evict(&mut self, id: ItemId) -> Option<CachedItem> {
        self.order.retain(|k| *k != id);
        let mut entry = self.entries.remove(&id)?;
        // Eviction is node-local; peers may still serve the item, so the
        // shared copy stays.
        entry.state.detach_shared();
        Some(entry)
    }
}

/// LRU cache of item data for one mailbox.
///
/// Misses fall through to the [`ItemDataStore`]; an entry's [`ItemState`] is
/// created when the item enters the cache and destroyed when it is evicted.
/// The cache doubles as the authoritative [`LruBacking`] for the
/// transactional LRU overlay.
pub struct ItemCache {
    mailbox_id: MailboxId,
    store: Arc<dyn ItemDataStore>,
    shared: Option<Arc<dyn SharedStateBackend>>,
    max_items: usize,
    inner: Mutex<CacheInner>,
}

impl ItemCache {
    /// Creates a cache bounded at `max_items` entries.
    pub fn new(mailbox_id: MailboxId, store: Arc<dyn ItemDataStore>, max_items: usize) -> Self {
        Self {
            mailbox_id,
            store,
            shared: None,
            max_items,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Binds item states created by this cache to the shared backend.
    ///
    /// Each cached item's state gets its own accessor; peers serving the
    /// same item address the same hash.
    #[must_use]
    pub fn with_shared(mut self, backend: Arc<dyn SharedStateBackend>) -> Self {
        self.shared = Some(backend);
        self
    }

    fn new_state(&self, id: ItemId) -> ItemState {
        let mut state = ItemState::new(id);
        if let Some(backend) = &self.shared {
            state.attach_shared(SharedStateAccessor::new(
                Arc::clone(backend),
                format!("state:{}:item:{}", self.mailbox_id.as_u64(), id.as_u64()),
            ));
        }
        state
    }

    /// The mailbox this cache serves.
    #[must_use]
    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox_id
    }

    /// Number of cached items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// True if the item is cached.
    #[must_use]
    pub fn contains(&self, id: ItemId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Reads an item's raw data, marking it accessed.
    ///
    /// A miss loads from the item-data store, creating fresh [`ItemState`]
    /// for the entry; an unknown item returns `None`. The load may push the
    /// cache past its bound - callers trim at transaction boundaries.
    pub fn get(&self, id: ItemId) -> CoreResult<Option<Vec<u8>>> {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(&id) {
                let raw = entry.raw.clone();
                inner.touch(id);
                return Ok(Some(raw));
            }
        }
        let Some(raw) = self.store.load_item_data(id)? else {
            return Ok(None);
        };
        debug!("item cache miss for {} in {}", id, self.mailbox_id);
        let state = self.new_state(id);
        let mut inner = self.inner.lock();
        inner.entries.insert(
            id,
            CachedItem {
                raw: raw.clone(),
                state,
            },
        );
        inner.touch(id);
        Ok(Some(raw))
    }

    /// Saves an item's raw data through the store and caches it.
    pub fn put(&self, id: ItemId, raw: Vec<u8>) -> CoreResult<()> {
        self.store.save_item_data(id, &raw)?;
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.raw = raw;
                inner.touch(id);
                return Ok(());
            }
        }
        // New entry: build (and warm up) its state outside the cache lock.
        let state = self.new_state(id);
        let mut inner = self.inner.lock();
        inner.entries.insert(id, CachedItem { raw, state });
        inner.touch(id);
        Ok(())
    }

    /// Runs a closure against a cached item's state.
    ///
    /// Returns `None` if the item is not cached; state exists only for
    /// cached items.
    pub fn with_state<R>(&self, id: ItemId, f: impl FnOnce(&mut ItemState) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.entries.get_mut(&id).map(|entry| f(&mut entry.state))
    }

    /// Evicts one item, returning it if it was cached.
    pub fn remove(&self, id: ItemId) -> Option<CachedItem> {
        self.inner.lock().evict(id)
    }

    /// Shrinks the cache to at most `max` entries, returning the evicted
    /// ids. Victim selection is delegated to `strategy`.
    pub fn trim(&self, max: usize, strategy: &dyn EvictionStrategy<ItemId>) -> Vec<ItemId> {
        let mut inner = self.inner.lock();
        let excess = inner.order.len().saturating_sub(max);
        if excess == 0 {
            return Vec::new();
        }
        let victims = strategy.select(&inner.order, excess);
        for victim in &victims {
            inner.evict(*victim);
        }
        debug!(
            "trimmed {} items from cache for {}",
            victims.len(),
            self.mailbox_id
        );
        victims
    }

    /// Shrinks the cache to its configured bound with the default strategy.
    pub fn trim_to_capacity(&self) -> Vec<ItemId> {
        self.trim(self.max_items, &DropOldest)
    }
}

impl LruBacking<ItemId> for ItemCache {
    fn load(&self) -> CoreResult<Vec<ItemId>> {
        Ok(self.inner.lock().order.clone())
    }

    fn apply(&self, change: &Change<ItemId, ()>) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        match change {
            // The entry may have been evicted between buffering and commit;
            // touching an uncached id is a no-op.
            Change::MarkAccessed { key } => {
                if inner.entries.contains_key(key) {
                    inner.touch(*key);
                }
            }
            Change::Remove { key } => {
                inner.evict(*key);
            }
            Change::Clear => {
                let ids: Vec<ItemId> = inner.order.clone();
                for id in ids {
                    inner.evict(id);
                }
            }
            other => {
                return Err(crate::error::CoreError::invalid_operation(format!(
                    "change {other:?} does not apply to an item cache"
                )))
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ItemCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemCache")
            .field("mailbox_id", &self.mailbox_id)
            .field("len", &self.len())
            .field("max_items", &self.max_items)
            .finish_non_exhaustive()
    }
}
