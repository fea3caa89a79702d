//! Integration tests driving two stores over one shared backend, as two
//! cluster nodes would.

use mailstate_backend::SharedStateBackend;
use mailstate_core::overlay::{MapBacking, SharedHashMapBacking};
use mailstate_core::{
    AccessMode, ChangeKind, CoreError, CounterKind, ItemChange, ItemFlag, ItemId, ListenerKind,
    MailboxId, MapOverlay, SessionListener,
};
use mailstate_testkit::prelude::*;
use std::sync::Arc;
use std::thread;

const MBOX: MailboxId = MailboxId::new(7);

#[test]
fn counters_converge_on_one_origin_value() {
    init_tracing();
    let (node_a, node_b, _backend) = clustered_pair();

    let ids_a = node_a.id_counter(MBOX).unwrap();
    let ids_b = node_b.id_counter(MBOX).unwrap();

    // Both nodes race to initialize during failover; the first wins and the
    // second adopts.
    assert_eq!(ids_a.set_if_not_exists(CounterKind::Item, 5).unwrap(), 5);
    assert_eq!(ids_b.set_if_not_exists(CounterKind::Item, 10).unwrap(), 5);
    assert_eq!(ids_b.value(CounterKind::Item).unwrap(), 5);
}

#[test]
fn concurrent_increments_never_lose_updates() {
    let (node_a, node_b, _backend) = clustered_pair();
    let ids_a = node_a.id_counter(MBOX).unwrap();
    let ids_b = node_b.id_counter(MBOX).unwrap();

    let mut handles = Vec::new();
    for ids in [Arc::clone(&ids_a), Arc::clone(&ids_b)] {
        for delta in 1..=4u64 {
            let ids = Arc::clone(&ids);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    ids.increment(CounterKind::Change, delta).unwrap();
                }
            }));
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let expected: u64 = 2 * (1..=4u64).map(|d| d * 25).sum::<u64>();
    assert_eq!(ids_a.value(CounterKind::Change).unwrap(), expected);
    assert_eq!(ids_b.value(CounterKind::Change).unwrap(), expected);
}

#[test]
fn write_lock_is_exclusive_cluster_wide() {
    let (node_a, node_b, _backend) = clustered_pair();
    let node_b = Arc::new(node_b);

    let guard = node_a.acquire_lock(MBOX, true).unwrap();
    assert!(node_a.locks().is_write_locked_by_current_thread(MBOX));

    let node_b2 = Arc::clone(&node_b);
    let blocked = thread::spawn(move || node_b2.acquire_lock(MBOX, true).map(|_| ()))
        .join()
        .unwrap();
    assert!(matches!(blocked, Err(CoreError::LockTimeout { .. })));

    guard.release();
    let node_b3 = Arc::clone(&node_b);
    thread::spawn(move || node_b3.acquire_lock(MBOX, true).unwrap().release())
        .join()
        .unwrap();
}

#[test]
fn notifications_reach_each_listener_exactly_once() {
    let (node_a, node_b, _backend) = clustered_pair();

    let on_a = RecordingListener::new(ListenerKind::Interactive);
    node_a
        .subscriber(MBOX)
        .unwrap()
        .add_listener(Arc::clone(&on_a) as Arc<dyn SessionListener>);
    let on_b = RecordingListener::new(ListenerKind::Interactive);
    node_b
        .subscriber(MBOX)
        .unwrap()
        .add_listener(Arc::clone(&on_b) as Arc<dyn SessionListener>);

    let publisher = node_a.publisher(MBOX).unwrap();
    publisher
        .publish(
            vec![ItemChange {
                item_id: ItemId::new(100),
                kind: ChangeKind::Created,
                reason: 1,
            }],
            11,
            None,
        )
        .unwrap();

    // Exactly once per listener: local synchronous delivery on the origin
    // node, channel delivery on the other, no echo back.
    assert_eq!(on_a.seen_change_ids(), vec![11]);
    assert_eq!(on_b.seen_change_ids(), vec![11]);
}

#[test]
fn empty_change_sets_stay_local() {
    let (node_a, node_b, _backend) = clustered_pair();

    let on_a = RecordingListener::new(ListenerKind::Interactive);
    node_a
        .subscriber(MBOX)
        .unwrap()
        .add_listener(Arc::clone(&on_a) as Arc<dyn SessionListener>);
    let on_b = RecordingListener::new(ListenerKind::Interactive);
    node_b
        .subscriber(MBOX)
        .unwrap()
        .add_listener(Arc::clone(&on_b) as Arc<dyn SessionListener>);

    node_a
        .publisher(MBOX)
        .unwrap()
        .publish(Vec::new(), 12, None)
        .unwrap();

    assert_eq!(on_a.seen_change_ids(), vec![12]);
    assert_eq!(on_b.seen_change_ids(), Vec::<u64>::new());
}

#[test]
fn peer_flag_flip_is_observed_after_refresh() {
    let (node_a, node_b, _backend) = clustered_pair();
    let store_a = node_a.with_item_store(Arc::new(MemoryItemStore::new()));
    let item_store_b = MemoryItemStore::new();
    item_store_b.seed(ItemId::new(10), vec![1]);
    let store_b = node_b.with_item_store(Arc::new(item_store_b));

    let cache_a = store_a.item_cache(MBOX).unwrap();
    cache_a.put(ItemId::new(10), vec![1]).unwrap();

    let cache_b = store_b.item_cache(MBOX).unwrap();
    cache_b.get(ItemId::new(10)).unwrap();

    // Node A flags the item; node B's bit test refreshes from the shared
    // hash and observes it.
    cache_a
        .with_state(ItemId::new(10), |state| state.set_flag(ItemFlag::Flagged))
        .unwrap();
    let seen = cache_b
        .with_state(ItemId::new(10), |state| state.is_set(ItemFlag::Flagged))
        .unwrap();
    assert!(seen);
}

#[test]
fn field_write_survives_backend_outage() {
    let (node_a, _node_b, backend) = clustered_pair();
    let state = node_a.mailbox_state(MBOX).unwrap();

    // Backend down: the write degrades to the local copy, reads still
    // return it.
    backend.set_offline(true);
    state.set_recent_count(5, AccessMode::Default);
    assert_eq!(state.recent_count(), 5);

    backend.set_offline(false);
    // Still 5 once the backend is back (local value; the hash never saw the
    // failed write).
    assert_eq!(state.recent_count(), 5);
}

#[test]
fn overlay_commit_is_visible_to_the_other_node() {
    let (node_a, node_b, backend) = clustered_pair();

    let overlay_a = MapOverlay::new(
        "folders",
        Arc::new(SharedHashMapBacking::new(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            "mbox:7:folders",
        )) as Arc<dyn MapBacking<String, String>>,
        Arc::clone(node_a.tracker()),
    );
    let overlay_b = MapOverlay::new(
        "folders",
        Arc::new(SharedHashMapBacking::new(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            "mbox:7:folders",
        )) as Arc<dyn MapBacking<String, String>>,
        Arc::clone(node_b.tracker()),
    );

    node_a.tracker().transaction_begin();
    overlay_a
        .put("inbox".to_owned(), "folder:2".to_owned())
        .unwrap();
    // Not visible remotely before commit.
    node_b.tracker().transaction_begin();
    assert_eq!(overlay_b.get(&"inbox".to_owned()).unwrap(), None);
    node_b.tracker().rollback_cache();

    node_a.tracker().commit_cache();

    node_b.tracker().transaction_begin();
    assert_eq!(
        overlay_b.get(&"inbox".to_owned()).unwrap(),
        Some("folder:2".to_owned())
    );
    node_b.tracker().rollback_cache();
}

#[test]
fn crash_between_commits_recovers_on_cold_read() {
    let (node_a, node_b, backend) = clustered_pair();

    let overlay_a = MapOverlay::new(
        "folders",
        Arc::new(SharedHashMapBacking::new(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            "mbox:7:folders",
        )) as Arc<dyn MapBacking<String, String>>,
        Arc::clone(node_a.tracker()),
    );

    // Seed authoritative state.
    backend.hash_set("mbox:7:folders", "inbox", "folder:2").unwrap();

    node_a.tracker().transaction_begin();
    overlay_a
        .put("drafts".to_owned(), "folder:6".to_owned())
        .unwrap();

    // The node "crashes" between the authoritative commit and the cache
    // flush: the backend rejects the replay.
    backend.set_offline(true);
    node_a.tracker().commit_cache();
    backend.set_offline(false);

    // The buffered change was lost, but nothing partial reached the backing
    // store and the next cold read converges on authoritative state.
    let overlay_b = MapOverlay::new(
        "folders",
        Arc::new(SharedHashMapBacking::new(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            "mbox:7:folders",
        )) as Arc<dyn MapBacking<String, String>>,
        Arc::clone(node_b.tracker()),
    );
    node_b.tracker().transaction_begin();
    let snapshot = overlay_b.snapshot().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get("inbox"), Some(&"folder:2".to_owned()));
    node_b.tracker().rollback_cache();

    // The crashed node's next transaction also repulls cleanly.
    node_a.tracker().transaction_begin();
    assert_eq!(overlay_a.get(&"drafts".to_owned()).unwrap(), None);
    node_a.tracker().rollback_cache();
}

#[test]
fn maintenance_rejects_foreign_threads_while_allowing_registered_ones() {
    let store = Arc::new(local_store());
    store.begin_maintenance(MBOX, false).unwrap();

    let store2 = Arc::clone(&store);
    thread::spawn(move || {
        let result = store2.mailbox_state(MBOX);
        assert!(matches!(result, Err(CoreError::Maintenance { .. })));
    })
    .join()
    .unwrap();

    let store3 = Arc::clone(&store);
    thread::spawn(move || {
        store3
            .register_maintenance_thread(MBOX, thread::current().id())
            .unwrap();
        store3.mailbox_state(MBOX).unwrap();
    })
    .join()
    .unwrap();

    store.end_maintenance(MBOX, true).unwrap();
}

#[test]
fn congruent_mailboxes_share_one_channel_per_node() {
    let (node_a, _node_b, backend) = clustered_pair();

    // 7 and 11 are congruent mod 4 and land on one shard.
    assert_eq!(node_a.hub().channel_index(MailboxId::new(7)), 3);
    assert_eq!(node_a.hub().channel_index(MailboxId::new(11)), 3);

    node_a.subscriber(MailboxId::new(7)).unwrap();
    node_a.subscriber(MailboxId::new(11)).unwrap();
    assert_eq!(node_a.hub().attached_channels(), 1);
    assert_eq!(backend.subscription_count(), 1);

    node_a.hub().drop_subscriber(MailboxId::new(7));
    node_a.hub().drop_subscriber(MailboxId::new(11));
    assert_eq!(backend.subscription_count(), 0);
}

#[test]
fn mailbox_counters_initialize_once_across_nodes() {
    let (node_a, node_b, _backend) = clustered_pair();

    let state_a = node_a.mailbox_state(MBOX).unwrap();
    let state_b = node_b.mailbox_state(MBOX).unwrap();

    assert_eq!(state_a.init_last_change_id(100).unwrap(), 100);
    assert_eq!(state_b.init_last_change_id(250).unwrap(), 100);

    // A later write on one node is the authoritative read on the other.
    state_b.set_last_change_id(101, AccessMode::Default);
    assert_eq!(state_a.last_change_id(), 101);
}
