//! Proptest generators for coordination-layer values.

use mailstate_core::{ChangeKind, CounterKind, ItemChange, ItemId, MailboxId};
use proptest::prelude::*;

/// Any mailbox id.
pub fn mailbox_id() -> impl Strategy<Value = MailboxId> {
    any::<u64>().prop_map(MailboxId::new)
}

/// Any item id.
pub fn item_id() -> impl Strategy<Value = ItemId> {
    any::<u64>().prop_map(ItemId::new)
}

/// Any counter kind.
pub fn counter_kind() -> impl Strategy<Value = CounterKind> {
    prop_oneof![
        Just(CounterKind::Item),
        Just(CounterKind::Search),
        Just(CounterKind::Change),
    ]
}

/// Positive increment deltas, sized for concurrent-sum tests.
pub fn deltas(max_len: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..1000, 1..=max_len)
}

/// Any change kind.
pub fn change_kind() -> impl Strategy<Value = ChangeKind> {
    prop_oneof![
        Just(ChangeKind::Created),
        Just(ChangeKind::Modified),
        Just(ChangeKind::Deleted),
    ]
}

/// One item-level change.
pub fn item_change() -> impl Strategy<Value = ItemChange> {
    (item_id(), change_kind(), any::<u32>()).prop_map(|(item_id, kind, reason)| ItemChange {
        item_id,
        kind,
        reason,
    })
}

/// A change set of bounded size, possibly empty.
pub fn change_set(max_len: usize) -> impl Strategy<Value = Vec<ItemChange>> {
    prop::collection::vec(item_change(), 0..=max_len)
}
