//! Canned stores, backends and listeners for tests.

use mailstate_backend::{MemoryBackend, SharedStateBackend};
use mailstate_core::{
    ChangeNotification, CoreResult, ItemDataStore, ItemId, ListenerKind, MailboxStore,
    SessionId, SessionListener, StoreConfig,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Installs a tracing subscriber honoring `RUST_LOG`, for debugging tests.
///
/// Safe to call from multiple tests; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A store configuration with short waits, suitable for tests.
#[must_use]
pub fn quick_config() -> StoreConfig {
    StoreConfig::new()
        .lock_timeout(Duration::from_millis(200))
        .max_lock_waiters(4)
        .channel_count(4)
        .item_cache_size(8)
}

/// A fresh shared backend.
#[must_use]
pub fn shared_backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new())
}

/// A local-only store.
#[must_use]
pub fn local_store() -> MailboxStore {
    MailboxStore::local(quick_config())
}

/// Two stores sharing one backend, acting as two cluster nodes.
///
/// # Panics
///
/// Panics if cluster construction fails; the backend is freshly created and
/// online.
#[must_use]
pub fn clustered_pair() -> (MailboxStore, MailboxStore, Arc<MemoryBackend>) {
    let backend = shared_backend();
    let node_a = MailboxStore::clustered(
        quick_config(),
        Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
    )
    .expect("backend is online");
    let node_b = MailboxStore::clustered(
        quick_config(),
        Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
    )
    .expect("backend is online");
    (node_a, node_b, backend)
}

/// A listener that records every notification it receives.
pub struct RecordingListener {
    id: SessionId,
    kind: ListenerKind,
    notifications: Mutex<Vec<ChangeNotification>>,
    disconnected: AtomicBool,
}

impl RecordingListener {
    /// Creates a listener with a fresh session id.
    #[must_use]
    pub fn new(kind: ListenerKind) -> Arc<Self> {
        Self::with_session(SessionId::new(), kind)
    }

    /// Creates a listener reusing an existing session id.
    #[must_use]
    pub fn with_session(id: SessionId, kind: ListenerKind) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            notifications: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    /// The change ids seen so far, in delivery order.
    #[must_use]
    pub fn seen_change_ids(&self) -> Vec<u64> {
        self.notifications.lock().iter().map(|n| n.change_id).collect()
    }

    /// Every notification received so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<ChangeNotification> {
        self.notifications.lock().clone()
    }

    /// True once the listener has been force-disconnected.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl SessionListener for RecordingListener {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn kind(&self) -> ListenerKind {
        self.kind
    }

    fn notify(&self, notification: &ChangeNotification) {
        self.notifications.lock().push(notification.clone());
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// An item-data store over a plain map.
#[derive(Default)]
pub struct MemoryItemStore {
    data: Mutex<HashMap<ItemId, Vec<u8>>>,
}

impl MemoryItemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an item directly, bypassing any cache.
    pub fn seed(&self, id: ItemId, raw: Vec<u8>) {
        self.data.lock().insert(id, raw);
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl ItemDataStore for MemoryItemStore {
    fn load_item_data(&self, id: ItemId) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.data.lock().get(&id).cloned())
    }

    fn save_item_data(&self, id: ItemId, raw: &[u8]) -> CoreResult<()> {
        self.data.lock().insert(id, raw.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clustered_pair_shares_state() {
        let (node_a, node_b, _backend) = clustered_pair();
        assert!(node_a.is_clustered());
        assert!(node_b.is_clustered());
    }

    #[test]
    fn recording_listener_records() {
        let listener = RecordingListener::new(ListenerKind::Interactive);
        assert!(listener.seen_change_ids().is_empty());
        assert!(!listener.is_disconnected());
        listener.disconnect();
        assert!(listener.is_disconnected());
    }

    #[test]
    fn memory_item_store_roundtrip() {
        let store = MemoryItemStore::new();
        store.seed(ItemId::new(1), vec![1, 2]);
        assert_eq!(
            store.load_item_data(ItemId::new(1)).unwrap(),
            Some(vec![1, 2])
        );
        store.save_item_data(ItemId::new(2), &[3]).unwrap();
        assert_eq!(store.len(), 2);
    }
}
