//! The per-process mailbox store facade.

use crate::cache::{ItemCache, ItemDataStore};
use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::field::SharedStateAccessor;
use crate::ids::{IdAllocator, LocalIdAllocator, SharedIdAllocator};
use crate::lock::maintenance::MaintenanceWindows;
use crate::lock::{LockGuard, LockManager};
use crate::notify::{NotificationHub, Publisher, Subscriber};
use crate::overlay::TransactionTracker;
use crate::state::{MailboxCounterStore, MailboxState};
use crate::types::MailboxId;
use mailstate_backend::SharedStateBackend;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::info;

/// Entry point to the coordination layer for one process.
///
/// Constructed once and injected; there are no process-wide globals. The
/// store owns the lock manager, the maintenance registry, the transaction
/// tracker, the notification hub, and the per-mailbox state, counter and
/// cache registries. Every accessor checks the mailbox's maintenance window
/// and fails with the maintenance error for unauthorized threads.
pub struct MailboxStore {
    config: StoreConfig,
    backend: Option<Arc<dyn SharedStateBackend>>,
    locks: LockManager,
    maintenance: MaintenanceWindows,
    tracker: Arc<TransactionTracker>,
    hub: Arc<NotificationHub>,
    item_store: Option<Arc<dyn ItemDataStore>>,
    counter_store: Option<Arc<dyn MailboxCounterStore>>,
    states: Mutex<HashMap<MailboxId, Arc<MailboxState>>>,
    allocators: Mutex<HashMap<MailboxId, Arc<dyn IdAllocator>>>,
    caches: Mutex<HashMap<MailboxId, Arc<ItemCache>>>,
}

impl MailboxStore {
    /// Creates a local-only store: no cluster backend, plain in-process
    /// locking, counters and notifications.
    #[must_use]
    pub fn local(config: StoreConfig) -> Self {
        let hub = NotificationHub::local(config.channel_count);
        Self {
            locks: LockManager::local(&config),
            maintenance: MaintenanceWindows::new(),
            tracker: Arc::new(TransactionTracker::new()),
            hub,
            backend: None,
            item_store: None,
            counter_store: None,
            states: Mutex::new(HashMap::new()),
            allocators: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Creates a cluster-mode store over the shared backend.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ClusterUnavailable`] if the backend does not
    /// answer a liveness check; this is fatal, never degrade-and-continue.
    pub fn clustered(
        config: StoreConfig,
        backend: Arc<dyn SharedStateBackend>,
    ) -> CoreResult<Self> {
        let locks = LockManager::clustered(&config, Arc::clone(&backend))?;
        let hub = NotificationHub::clustered(Arc::clone(&backend), config.channel_count);
        info!("mailbox store opened in cluster mode");
        Ok(Self {
            locks,
            maintenance: MaintenanceWindows::new(),
            tracker: Arc::new(TransactionTracker::new()),
            hub,
            backend: Some(backend),
            item_store: None,
            counter_store: None,
            states: Mutex::new(HashMap::new()),
            allocators: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Attaches the opaque item-data collaborator, enabling item caches.
    #[must_use]
    pub fn with_item_store(mut self, item_store: Arc<dyn ItemDataStore>) -> Self {
        self.item_store = Some(item_store);
        self
    }

    /// Attaches the opaque mailbox-counter collaborator.
    ///
    /// Freshly opened mailboxes are seeded from it, and
    /// [`MailboxStore::persist_counters`] writes back through it.
    #[must_use]
    pub fn with_counter_store(mut self, counter_store: Arc<dyn MailboxCounterStore>) -> Self {
        self.counter_store = Some(counter_store);
        self
    }

    /// True if this store coordinates through a shared backend.
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.backend.is_some()
    }

    /// The process-wide transaction tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<TransactionTracker> {
        &self.tracker
    }

    /// The lock manager, for reentrancy assertions.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// The notification hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Acquires the mailbox lock.
    ///
    /// # Errors
    ///
    /// Fails with the maintenance error for threads outside an active
    /// window's allow-list, or with the lock layer's distinguished errors.
    pub fn acquire_lock(&self, mailbox_id: MailboxId, write: bool) -> CoreResult<LockGuard> {
        self.maintenance.check(mailbox_id)?;
        self.locks.acquire(mailbox_id, write)
    }

    /// The mailbox's state bundle, created on first open.
    ///
    /// One instance is shared by all operations on the mailbox in this
    /// process. In cluster mode the bundle is bound to its shared hash and
    /// warmed up on creation.
    pub fn mailbox_state(&self, mailbox_id: MailboxId) -> CoreResult<Arc<MailboxState>> {
        self.maintenance.check(mailbox_id)?;
        let mut states = self.states.lock();
        if let Some(state) = states.get(&mailbox_id) {
            return Ok(Arc::clone(state));
        }
        let state = Arc::new(MailboxState::new(mailbox_id));
        if let Some(backend) = &self.backend {
            state.attach_shared(SharedStateAccessor::new(
                Arc::clone(backend),
                format!("state:{}", mailbox_id.as_u64()),
            ));
        }
        if let Some(counter_store) = &self.counter_store {
            if let Some(counters) = counter_store.load_counters(mailbox_id)? {
                state.seed_counters(&counters)?;
            }
        }
        states.insert(mailbox_id, Arc::clone(&state));
        Ok(state)
    }

    /// Writes the mailbox's current counters back through the counter
    /// collaborator.
    ///
    /// # Errors
    ///
    /// Fails if the store was built without a counter store, or if the
    /// mailbox has not been opened.
    pub fn persist_counters(&self, mailbox_id: MailboxId) -> CoreResult<()> {
        let counter_store = self.counter_store.as_ref().ok_or_else(|| {
            CoreError::invalid_operation("store was built without a mailbox counter store")
        })?;
        let state = self
            .states
            .lock()
            .get(&mailbox_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("{mailbox_id} has not been opened"))
            })?;
        counter_store.save_counters(mailbox_id, &state.counters())
    }

    /// The mailbox's ID allocator.
    pub fn id_counter(&self, mailbox_id: MailboxId) -> CoreResult<Arc<dyn IdAllocator>> {
        self.maintenance.check(mailbox_id)?;
        let mut allocators = self.allocators.lock();
        if let Some(allocator) = allocators.get(&mailbox_id) {
            return Ok(Arc::clone(allocator));
        }
        let allocator: Arc<dyn IdAllocator> = match &self.backend {
            Some(backend) => Arc::new(SharedIdAllocator::new(Arc::clone(backend), mailbox_id)),
            None => Arc::new(LocalIdAllocator::new()),
        };
        allocators.insert(mailbox_id, Arc::clone(&allocator));
        Ok(allocator)
    }

    /// The mailbox's item cache.
    ///
    /// # Errors
    ///
    /// Fails if the store was built without an item-data collaborator.
    pub fn item_cache(&self, mailbox_id: MailboxId) -> CoreResult<Arc<ItemCache>> {
        self.maintenance.check(mailbox_id)?;
        let item_store = self.item_store.as_ref().ok_or_else(|| {
            CoreError::invalid_operation("store was built without an item data store")
        })?;
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(&mailbox_id) {
            return Ok(Arc::clone(cache));
        }
        let mut cache = ItemCache::new(
            mailbox_id,
            Arc::clone(item_store),
            self.config.item_cache_size,
        );
        if let Some(backend) = &self.backend {
            cache = cache.with_shared(Arc::clone(backend));
        }
        let cache = Arc::new(cache);
        caches.insert(mailbox_id, Arc::clone(&cache));
        Ok(cache)
    }

    /// A publisher for the mailbox's committed change sets.
    pub fn publisher(&self, mailbox_id: MailboxId) -> CoreResult<Publisher> {
        self.maintenance.check(mailbox_id)?;
        self.hub.publisher(mailbox_id)
    }

    /// The mailbox's listener registry.
    pub fn subscriber(&self, mailbox_id: MailboxId) -> CoreResult<Arc<Subscriber>> {
        self.maintenance.check(mailbox_id)?;
        self.hub.subscriber(mailbox_id)
    }

    /// Puts the mailbox into maintenance.
    ///
    /// Listener sessions are force-disconnected and the cached state object
    /// is handed to the window for detachment at the end.
    ///
    /// # Errors
    ///
    /// Fails when a window is already active and nesting is not permitted
    /// for the calling thread.
    pub fn begin_maintenance(&self, mailbox_id: MailboxId, nested_allowed: bool) -> CoreResult<()> {
        self.maintenance.begin(mailbox_id, nested_allowed)?;
        if let Some(subscriber) = self.hub.existing_subscriber(mailbox_id) {
            subscriber.purge_listeners();
        }
        if let Some(state) = self.states.lock().get(&mailbox_id) {
            self.maintenance.cache_state(mailbox_id, Arc::clone(state));
        }
        Ok(())
    }

    /// Adds a thread to the mailbox's maintenance allow-list.
    pub fn register_maintenance_thread(
        &self,
        mailbox_id: MailboxId,
        thread: ThreadId,
    ) -> CoreResult<()> {
        self.maintenance.register_thread(mailbox_id, thread)
    }

    /// Ends the mailbox's maintenance window.
    ///
    /// The cached state object is detached and dropped from the registry
    /// either way; the next open rebuilds it from the backend.
    pub fn end_maintenance(&self, mailbox_id: MailboxId, success: bool) -> CoreResult<()> {
        self.maintenance.end(mailbox_id, success)?;
        self.states.lock().remove(&mailbox_id);
        Ok(())
    }

    /// True if a maintenance window is active on the mailbox.
    #[must_use]
    pub fn in_maintenance(&self, mailbox_id: MailboxId) -> bool {
        self.maintenance.is_active(mailbox_id)
    }
}

impl std::fmt::Debug for MailboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxStore")
            .field("clustered", &self.is_clustered())
            .field("open_mailboxes", &self.states.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CounterKind;
    use mailstate_backend::MemoryBackend;
    use std::thread;
    use std::time::Duration;

    const MBOX: MailboxId = MailboxId::new(3);

    fn quick_config() -> StoreConfig {
        StoreConfig::new()
            .lock_timeout(Duration::from_millis(100))
            .channel_count(4)
    }

    #[test]
    fn local_store_end_to_end() {
        let store = MailboxStore::local(quick_config());
        assert!(!store.is_clustered());

        let guard = store.acquire_lock(MBOX, true).unwrap();
        let state = store.mailbox_state(MBOX).unwrap();
        state.set_total_size(10, crate::field::AccessMode::Default);

        let ids = store.id_counter(MBOX).unwrap();
        assert_eq!(ids.increment(CounterKind::Item, 1).unwrap(), 1);

        guard.release();
        assert!(store.locks().is_unlocked(MBOX));
    }

    #[test]
    fn mailbox_state_is_one_instance_per_open() {
        let store = MailboxStore::local(quick_config());
        let a = store.mailbox_state(MBOX).unwrap();
        let b = store.mailbox_state(MBOX).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn clustered_store_fails_fast_without_backend() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_offline(true);
        let result = MailboxStore::clustered(
            quick_config(),
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
        );
        assert!(matches!(result, Err(CoreError::ClusterUnavailable { .. })));
    }

    #[test]
    fn maintenance_blocks_unauthorized_threads() {
        let store = Arc::new(MailboxStore::local(quick_config()));
        store.begin_maintenance(MBOX, false).unwrap();

        // The initiating thread still operates normally.
        store.mailbox_state(MBOX).unwrap();

        let store2 = Arc::clone(&store);
        thread::spawn(move || {
            assert!(matches!(
                store2.acquire_lock(MBOX, true),
                Err(CoreError::Maintenance { .. })
            ));
            assert!(matches!(
                store2.mailbox_state(MBOX),
                Err(CoreError::Maintenance { .. })
            ));
            assert!(matches!(
                store2.id_counter(MBOX),
                Err(CoreError::Maintenance { .. })
            ));
            assert!(store2.publisher(MBOX).is_err());
        })
        .join()
        .unwrap();

        store.end_maintenance(MBOX, true).unwrap();
        assert!(!store.in_maintenance(MBOX));
    }

    #[test]
    fn registered_thread_may_operate_during_maintenance() {
        let store = Arc::new(MailboxStore::local(quick_config()));
        store.begin_maintenance(MBOX, false).unwrap();

        let store2 = Arc::clone(&store);
        let worker = thread::spawn(move || {
            let me = thread::current().id();
            store2.register_maintenance_thread(MBOX, me).unwrap();
            store2.mailbox_state(MBOX).unwrap();
        });
        worker.join().unwrap();
    }

    #[test]
    fn maintenance_purges_listeners_and_detaches_state() {
        let store = MailboxStore::local(quick_config());
        let state_before = store.mailbox_state(MBOX).unwrap();
        store.subscriber(MBOX).unwrap();

        store.begin_maintenance(MBOX, false).unwrap();
        assert_eq!(store.hub().num_listeners(MBOX), 0);
        store.end_maintenance(MBOX, false).unwrap();

        // The state registry was reset; a reopen builds a fresh bundle.
        let state_after = store.mailbox_state(MBOX).unwrap();
        assert!(!Arc::ptr_eq(&state_before, &state_after));
    }

    #[test]
    fn item_cache_requires_collaborator() {
        let store = MailboxStore::local(quick_config());
        assert!(matches!(
            store.item_cache(MBOX),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn counters_seed_from_collaborator_and_persist_back() {
        use crate::state::{MailboxCounterStore, MailboxCounters};

        #[derive(Default)]
        struct MapCounterStore {
            data: Mutex<HashMap<MailboxId, MailboxCounters>>,
        }

        impl MailboxCounterStore for MapCounterStore {
            fn load_counters(&self, id: MailboxId) -> CoreResult<Option<MailboxCounters>> {
                Ok(self.data.lock().get(&id).copied())
            }
            fn save_counters(&self, id: MailboxId, counters: &MailboxCounters) -> CoreResult<()> {
                self.data.lock().insert(id, *counters);
                Ok(())
            }
        }

        let counter_store = Arc::new(MapCounterStore::default());
        counter_store.data.lock().insert(
            MBOX,
            MailboxCounters {
                last_item_id: 40,
                last_search_id: 4,
                last_change_id: 400,
                total_size: 2048,
            },
        );

        let store = MailboxStore::local(quick_config())
            .with_counter_store(Arc::clone(&counter_store) as Arc<dyn MailboxCounterStore>);

        let state = store.mailbox_state(MBOX).unwrap();
        assert_eq!(state.last_item_id(), 40);
        assert_eq!(state.total_size(), 2048);

        state.set_last_item_id(41, crate::field::AccessMode::Default);
        store.persist_counters(MBOX).unwrap();
        assert_eq!(
            counter_store.data.lock().get(&MBOX).unwrap().last_item_id,
            41
        );
    }
}
