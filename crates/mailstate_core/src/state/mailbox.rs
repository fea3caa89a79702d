//! Per-mailbox synchronized state.

use crate::error::CoreResult;
use crate::field::codec::{ScalarCodec, StringCodec};
use crate::field::{AccessMode, SharedStateAccessor, SyncedField};
use crate::types::MailboxId;
use parking_lot::Mutex;
use std::collections::HashMap;

/// A snapshot of a mailbox's persisted counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxCounters {
    /// Highest item id handed out.
    pub last_item_id: u64,
    /// Highest search id handed out.
    pub last_search_id: u64,
    /// Highest change id committed.
    pub last_change_id: u64,
    /// Total mailbox size in bytes.
    pub total_size: u64,
}

/// Persistent home of mailbox counters, consumed as an opaque collaborator.
///
/// Counters loaded from here seed a freshly opened mailbox; in cluster mode
/// the seed goes through set-if-not-exists so concurrent openers on
/// different nodes converge on one origin value.
pub trait MailboxCounterStore: Send + Sync {
    /// Loads the persisted counters for a mailbox, if any.
    fn load_counters(&self, mailbox_id: MailboxId) -> CoreResult<Option<MailboxCounters>>;

    /// Saves the counters for a mailbox.
    fn save_counters(&self, mailbox_id: MailboxId, counters: &MailboxCounters) -> CoreResult<()>;
}

struct MailboxFields {
    shared: Option<SharedStateAccessor>,
    last_item_id: SyncedField<u64>,
    last_search_id: SyncedField<u64>,
    last_change_id: SyncedField<u64>,
    total_size: SyncedField<u64>,
    contact_count: SyncedField<u32>,
    recent_count: SyncedField<u32>,
    config: HashMap<String, SyncedField<String>>,
}

impl MailboxFields {
    fn config_field(&mut self, section: &str) -> &mut SyncedField<String> {
        // Config section names are dynamic; field names in the backing hash
        // are namespaced to keep them clear of the fixed fields.
        self.config
            .entry(section.to_owned())
            .or_insert_with(|| SyncedField::new(format!("config:{section}"), StringCodec))
    }
}

/// All mutable state scoped to one mailbox.
///
/// Created once per mailbox open; one instance is shared by every operation
/// on that mailbox within a process, so access is internally synchronized.
pub struct MailboxState {
    mailbox_id: MailboxId,
    fields: Mutex<MailboxFields>,
}

impl MailboxState {
    /// Creates fresh local-only state for a mailbox.
    #[must_use]
    pub fn new(mailbox_id: MailboxId) -> Self {
        Self {
            mailbox_id,
            // Counters start unset: a zero pushed during warm-up would
            // occupy the hash field and defeat set-if-not-exists
            // initialization racing across nodes.
            fields: Mutex::new(MailboxFields {
                shared: None,
                last_item_id: SyncedField::new("lastItemId", ScalarCodec::new()),
                last_search_id: SyncedField::new("lastSearchId", ScalarCodec::new()),
                last_change_id: SyncedField::new("lastChangeId", ScalarCodec::new()),
                total_size: SyncedField::new("totalSize", ScalarCodec::new()),
                contact_count: SyncedField::new("contactCount", ScalarCodec::new()),
                recent_count: SyncedField::new("recentCount", ScalarCodec::new()),
                config: HashMap::new(),
            }),
        }
    }

    /// The mailbox this state belongs to.
    #[must_use]
    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox_id
    }

    /// Attaches the shared representation and warms it up from any non-empty
    /// local values.
    pub fn attach_shared(&self, accessor: SharedStateAccessor) {
        let mut fields = self.fields.lock();
        fields.shared = Some(accessor);
        Self::sync_locked(&mut fields);
    }

    /// True if a shared accessor is attached.
    #[must_use]
    pub fn has_shared(&self) -> bool {
        self.fields.lock().shared.is_some()
    }

    /// Drops the shared binding, leaving the backend copy in place.
    pub fn detach_shared(&self) {
        self.fields.lock().shared = None;
    }

    fn sync_locked(fields: &mut MailboxFields) {
        let Some(accessor) = fields.shared.clone() else {
            return;
        };
        fields.last_item_id.sync(&accessor);
        fields.last_search_id.sync(&accessor);
        fields.last_change_id.sync(&accessor);
        fields.total_size.sync(&accessor);
        fields.contact_count.sync(&accessor);
        fields.recent_count.sync(&accessor);
        for field in fields.config.values_mut() {
            field.sync(&accessor);
        }
    }

    /// Highest item id handed out so far.
    pub fn last_item_id(&self) -> u64 {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_item_id.get(shared.as_ref()).unwrap_or(0)
    }

    /// Records a newly handed-out item id.
    pub fn set_last_item_id(&self, id: u64, mode: AccessMode) {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_item_id.set(id, mode, shared.as_ref());
    }

    /// Atomically initializes the last item id cluster-wide, adopting the
    /// winning value.
    pub fn init_last_item_id(&self, id: u64) -> CoreResult<u64> {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_item_id.set_if_not_exists(id, shared.as_ref())
    }

    /// Highest search id handed out so far.
    pub fn last_search_id(&self) -> u64 {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_search_id.get(shared.as_ref()).unwrap_or(0)
    }

    /// Records a newly handed-out search id.
    pub fn set_last_search_id(&self, id: u64, mode: AccessMode) {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_search_id.set(id, mode, shared.as_ref());
    }

    /// Atomically initializes the last search id cluster-wide.
    pub fn init_last_search_id(&self, id: u64) -> CoreResult<u64> {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_search_id.set_if_not_exists(id, shared.as_ref())
    }

    /// Highest change id committed so far.
    pub fn last_change_id(&self) -> u64 {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_change_id.get(shared.as_ref()).unwrap_or(0)
    }

    /// Records a newly committed change id.
    pub fn set_last_change_id(&self, id: u64, mode: AccessMode) {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_change_id.set(id, mode, shared.as_ref());
    }

    /// Atomically initializes the last change id cluster-wide.
    pub fn init_last_change_id(&self, id: u64) -> CoreResult<u64> {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.last_change_id.set_if_not_exists(id, shared.as_ref())
    }

    /// Total mailbox size in bytes.
    pub fn total_size(&self) -> u64 {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.total_size.get(shared.as_ref()).unwrap_or(0)
    }

    /// Sets the total mailbox size.
    pub fn set_total_size(&self, size: u64, mode: AccessMode) {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.total_size.set(size, mode, shared.as_ref());
    }

    /// Number of contacts in the mailbox.
    pub fn contact_count(&self) -> u32 {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.contact_count.get(shared.as_ref()).unwrap_or(0)
    }

    /// Sets the contact count.
    pub fn set_contact_count(&self, count: u32, mode: AccessMode) {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.contact_count.set(count, mode, shared.as_ref());
    }

    /// Number of recently delivered messages.
    pub fn recent_count(&self) -> u32 {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.recent_count.get(shared.as_ref()).unwrap_or(0)
    }

    /// Sets the recent-message count.
    pub fn set_recent_count(&self, count: u32, mode: AccessMode) {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.recent_count.set(count, mode, shared.as_ref());
    }

    /// Seeds the mailbox from persisted counters.
    ///
    /// The id counters go through set-if-not-exists, so when several nodes
    /// open the same mailbox during failover the first seed wins everywhere.
    /// The size is adopted locally only; the shared copy, if any node wrote
    /// one, stays authoritative.
    pub fn seed_counters(&self, counters: &MailboxCounters) -> CoreResult<()> {
        self.init_last_item_id(counters.last_item_id)?;
        self.init_last_search_id(counters.last_search_id)?;
        self.init_last_change_id(counters.last_change_id)?;
        let mut fields = self.fields.lock();
        if fields.total_size.local().is_none() {
            fields
                .total_size
                .set(counters.total_size, AccessMode::LocalOnly, None);
        }
        Ok(())
    }

    /// Snapshots the current counters for persistence.
    #[must_use]
    pub fn counters(&self) -> MailboxCounters {
        MailboxCounters {
            last_item_id: self.last_item_id(),
            last_search_id: self.last_search_id(),
            last_change_id: self.last_change_id(),
            total_size: self.total_size(),
        }
    }

    /// Reads a named config section, if set.
    pub fn config_value(&self, section: &str) -> Option<String> {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.config_field(section).get(shared.as_ref())
    }

    /// Writes a named config section.
    pub fn set_config_value(&self, section: &str, value: String, mode: AccessMode) {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.config_field(section).set(value, mode, shared.as_ref());
    }

    /// Removes a named config section from both representations.
    pub fn delete_config_value(&self, section: &str) {
        let mut fields = self.fields.lock();
        let shared = fields.shared.clone();
        fields.config_field(section).unset(shared.as_ref());
        fields.config.remove(section);
    }
}

impl std::fmt::Debug for MailboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxState")
            .field("mailbox_id", &self.mailbox_id)
            .field("shared", &self.has_shared())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailstate_backend::{MemoryBackend, SharedStateBackend};
    use std::sync::Arc;

    fn shared_pair() -> (Arc<MemoryBackend>, SharedStateAccessor) {
        let backend = Arc::new(MemoryBackend::new());
        let acc = SharedStateAccessor::new(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            "mbox:7:state",
        );
        (backend, acc)
    }

    #[test]
    fn local_counters_default_to_zero() {
        let state = MailboxState::new(MailboxId::new(7));
        assert_eq!(state.last_item_id(), 0);
        assert_eq!(state.total_size(), 0);
        assert_eq!(state.contact_count(), 0);
    }

    #[test]
    fn init_adopts_existing_cluster_value() {
        let (backend, acc) = shared_pair();
        let node_a = MailboxState::new(MailboxId::new(7));
        node_a.attach_shared(acc);

        let node_b = MailboxState::new(MailboxId::new(7));
        node_b.attach_shared(SharedStateAccessor::new(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            "mbox:7:state",
        ));

        assert_eq!(node_a.init_last_item_id(5).unwrap(), 5);
        // Second opener proposes a different origin and must adopt the first.
        assert_eq!(node_b.init_last_item_id(10).unwrap(), 5);
        assert_eq!(node_b.last_item_id(), 5);
    }

    #[test]
    fn peer_update_is_visible_through_get() {
        let (backend, acc) = shared_pair();
        let state = MailboxState::new(MailboxId::new(7));
        state.attach_shared(acc);

        let peer = SharedStateAccessor::new(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            "mbox:7:state",
        );
        peer.set("totalSize", "123456").unwrap();

        assert_eq!(state.total_size(), 123456);
    }

    #[test]
    fn remote_only_write_leaves_local_copy() {
        let (backend, acc) = shared_pair();
        let state = MailboxState::new(MailboxId::new(7));
        state.attach_shared(acc.clone());
        state.set_contact_count(4, AccessMode::Default);

        state.set_contact_count(9, AccessMode::RemoteOnly);
        assert_eq!(acc.get("contactCount").unwrap(), Some("9".to_owned()));

        // Offline, the stale local copy is what remains visible.
        backend.set_offline(true);
        assert_eq!(state.contact_count(), 4);
    }

    #[test]
    fn config_sections_are_synchronized() {
        let (_backend, acc) = shared_pair();
        let state = MailboxState::new(MailboxId::new(7));
        state.attach_shared(acc.clone());

        state.set_config_value("imap", "{\"idle\":true}".to_owned(), AccessMode::Default);
        assert_eq!(
            state.config_value("imap"),
            Some("{\"idle\":true}".to_owned())
        );
        assert_eq!(
            acc.get("config:imap").unwrap(),
            Some("{\"idle\":true}".to_owned())
        );

        state.delete_config_value("imap");
        assert_eq!(acc.get("config:imap").unwrap(), None);
        assert_eq!(state.config_value("imap"), None);
    }

    #[test]
    fn seeding_races_converge_on_first_opener() {
        let (backend, acc) = shared_pair();
        let node_a = MailboxState::new(MailboxId::new(7));
        node_a.attach_shared(acc);
        let node_b = MailboxState::new(MailboxId::new(7));
        node_b.attach_shared(SharedStateAccessor::new(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            "mbox:7:state",
        ));

        // Two nodes load different persisted snapshots during failover.
        node_a
            .seed_counters(&MailboxCounters {
                last_item_id: 40,
                last_search_id: 4,
                last_change_id: 400,
                total_size: 1000,
            })
            .unwrap();
        node_b
            .seed_counters(&MailboxCounters {
                last_item_id: 45,
                last_search_id: 5,
                last_change_id: 450,
                total_size: 1100,
            })
            .unwrap();

        assert_eq!(node_b.last_item_id(), 40);
        assert_eq!(node_b.last_search_id(), 4);
        assert_eq!(node_b.last_change_id(), 400);
        assert_eq!(node_a.counters().last_item_id, 40);
    }

    #[test]
    fn degraded_backend_keeps_local_writes_visible() {
        let (backend, acc) = shared_pair();
        let state = MailboxState::new(MailboxId::new(7));
        state.attach_shared(acc);

        backend.set_offline(true);
        state.set_total_size(777, AccessMode::Default);
        assert_eq!(state.total_size(), 777);
    }
}
