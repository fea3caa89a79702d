//! Per-item synchronized state.

use crate::error::CoreResult;
use crate::field::codec::{ScalarCodec, StringCodec, TagListCodec};
use crate::field::values::{Acl, AclCodec, Color, ColorCodec, RetentionPolicy, RetentionPolicyCodec};
use crate::field::{AccessMode, SharedStateAccessor, SyncedField};
use crate::types::ItemId;

/// One logical flag inside the item flags bitmask.
///
/// Several logical flags share one integer field; bit tests and updates go
/// through `refresh()` first so a peer's writes are observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFlag {
    /// The item has an attachment.
    Attached,
    /// The item has been replied to.
    Replied,
    /// The item is user-flagged.
    Flagged,
    /// The item has been forwarded.
    Forwarded,
    /// The item is an unsent draft.
    Draft,
    /// The item is marked for deletion.
    Deleted,
}

impl ItemFlag {
    /// The flag's bit in the shared bitmask.
    #[must_use]
    pub const fn mask(self) -> i32 {
        match self {
            ItemFlag::Attached => 1 << 0,
            ItemFlag::Replied => 1 << 1,
            ItemFlag::Flagged => 1 << 2,
            ItemFlag::Forwarded => 1 << 3,
            ItemFlag::Draft => 1 << 4,
            ItemFlag::Deleted => 1 << 5,
        }
    }
}

/// All mutable state underlying one mail item.
///
/// Created when an item is loaded or created, destroyed when the item is
/// evicted from its mailbox's cache. Every attribute is a [`SyncedField`];
/// attaching a [`SharedStateAccessor`] puts the bundle in cluster mode.
pub struct ItemState {
    item_id: ItemId,
    shared: Option<SharedStateAccessor>,
    version: SyncedField<u32>,
    metadata_version: SyncedField<u32>,
    folder_id: SyncedField<u64>,
    flags: SyncedField<i32>,
    tags: SyncedField<Vec<String>>,
    size: SyncedField<u64>,
    date: SyncedField<i64>,
    date_changed: SyncedField<i64>,
    unread_count: SyncedField<i32>,
    color: SyncedField<Color>,
    rights: SyncedField<Acl>,
    retention: SyncedField<RetentionPolicy>,
    metadata: SyncedField<String>,
}

impl ItemState {
    /// Creates fresh local-only state for an item.
    #[must_use]
    pub fn new(item_id: ItemId) -> Self {
        Self {
            item_id,
            shared: None,
            version: SyncedField::with_initial("version", ScalarCodec::new(), 1),
            metadata_version: SyncedField::with_initial("metadataVersion", ScalarCodec::new(), 1),
            folder_id: SyncedField::with_initial("folderId", ScalarCodec::new(), 0),
            flags: SyncedField::with_initial("flags", ScalarCodec::new(), 0),
            tags: SyncedField::with_initial("tags", TagListCodec, Vec::new()),
            size: SyncedField::with_initial("size", ScalarCodec::new(), 0),
            date: SyncedField::with_initial("date", ScalarCodec::new(), 0),
            date_changed: SyncedField::with_initial("dateChanged", ScalarCodec::new(), 0),
            unread_count: SyncedField::with_initial("unreadCount", ScalarCodec::new(), 0),
            color: SyncedField::with_initial("color", ColorCodec, Color::NONE),
            rights: SyncedField::new("rights", AclCodec),
            retention: SyncedField::new("retentionPolicy", RetentionPolicyCodec),
            metadata: SyncedField::new("metadata", StringCodec),
        }
    }

    /// The item this state belongs to.
    #[must_use]
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// Attaches the shared representation and warms it up from any non-empty
    /// local values.
    pub fn attach_shared(&mut self, accessor: SharedStateAccessor) {
        self.shared = Some(accessor);
        self.sync_with_shared();
    }

    /// True if a shared accessor is attached.
    #[must_use]
    pub fn has_shared(&self) -> bool {
        self.shared.is_some()
    }

    /// Drops the shared binding, leaving the backend copy in place.
    ///
    /// Used on cache eviction: other nodes may still be serving the item.
    pub fn detach_shared(&mut self) {
        self.shared = None;
    }

    /// Deletes the backend copy and drops the binding.
    ///
    /// Used when the item itself is destroyed.
    pub fn purge_shared(&mut self) -> CoreResult<()> {
        if let Some(accessor) = self.shared.take() {
            accessor.delete()?;
        }
        Ok(())
    }

    /// Pushes every non-empty local value to the shared side.
    pub fn sync_with_shared(&mut self) {
        let Some(accessor) = self.shared.clone() else {
            return;
        };
        self.version.sync(&accessor);
        self.metadata_version.sync(&accessor);
        self.folder_id.sync(&accessor);
        self.flags.sync(&accessor);
        self.tags.sync(&accessor);
        self.size.sync(&accessor);
        self.date.sync(&accessor);
        self.date_changed.sync(&accessor);
        self.unread_count.sync(&accessor);
        self.color.sync(&accessor);
        self.rights.sync(&accessor);
        self.retention.sync(&accessor);
        self.metadata.sync(&accessor);
    }

    /// Item content version.
    pub fn version(&mut self) -> u32 {
        self.version.get(self.shared.as_ref()).unwrap_or(1)
    }

    /// Sets the item content version.
    pub fn set_version(&mut self, version: u32, mode: AccessMode) {
        self.version.set(version, mode, self.shared.as_ref());
    }

    /// Bumps the item content version.
    pub fn increment_version(&mut self) {
        let next = self.version() + 1;
        self.set_version(next, AccessMode::Default);
    }

    /// Item metadata version.
    pub fn metadata_version(&mut self) -> u32 {
        self.metadata_version.get(self.shared.as_ref()).unwrap_or(1)
    }

    /// Sets the metadata version.
    pub fn set_metadata_version(&mut self, version: u32, mode: AccessMode) {
        self.metadata_version.set(version, mode, self.shared.as_ref());
    }

    /// Bumps the metadata version.
    pub fn increment_metadata_version(&mut self) {
        let next = self.metadata_version() + 1;
        self.set_metadata_version(next, AccessMode::Default);
    }

    /// Containing folder id.
    pub fn folder_id(&mut self) -> u64 {
        self.folder_id.get(self.shared.as_ref()).unwrap_or(0)
    }

    /// Moves the item to another folder.
    pub fn set_folder_id(&mut self, folder_id: u64) {
        self.folder_id
            .set(folder_id, AccessMode::Default, self.shared.as_ref());
    }

    /// The raw flags bitmask.
    pub fn flags(&mut self) -> i32 {
        self.flags.get(self.shared.as_ref()).unwrap_or(0)
    }

    /// Replaces the whole flags bitmask.
    pub fn set_flags(&mut self, flags: i32) {
        self.flags.set(flags, AccessMode::Default, self.shared.as_ref());
    }

    /// Tests one logical flag against the refreshed bitmask.
    pub fn is_set(&mut self, flag: ItemFlag) -> bool {
        self.flags.refresh(self.shared.as_ref());
        self.flags.local().copied().unwrap_or(0) & flag.mask() != 0
    }

    /// Sets one logical flag, preserving the others.
    pub fn set_flag(&mut self, flag: ItemFlag) {
        self.flags.refresh(self.shared.as_ref());
        let next = self.flags.local().copied().unwrap_or(0) | flag.mask();
        self.set_flags(next);
    }

    /// Clears one logical flag, preserving the others.
    pub fn unset_flag(&mut self, flag: ItemFlag) {
        self.flags.refresh(self.shared.as_ref());
        let next = self.flags.local().copied().unwrap_or(0) & !flag.mask();
        self.set_flags(next);
    }

    /// The item's tags.
    pub fn tags(&mut self) -> Vec<String> {
        self.tags.get(self.shared.as_ref()).unwrap_or_default()
    }

    /// Replaces the item's tags.
    pub fn set_tags(&mut self, tags: Vec<String>, mode: AccessMode) {
        self.tags.set(tags, mode, self.shared.as_ref());
    }

    /// Item size in bytes.
    pub fn size(&mut self) -> u64 {
        self.size.get(self.shared.as_ref()).unwrap_or(0)
    }

    /// Sets the item size.
    pub fn set_size(&mut self, size: u64) {
        self.size.set(size, AccessMode::Default, self.shared.as_ref());
    }

    /// Item date (seconds since epoch).
    pub fn date(&mut self) -> i64 {
        self.date.get(self.shared.as_ref()).unwrap_or(0)
    }

    /// Sets the item date.
    pub fn set_date(&mut self, date: i64) {
        self.date.set(date, AccessMode::Default, self.shared.as_ref());
    }

    /// Last-change date (seconds since epoch).
    pub fn date_changed(&mut self) -> i64 {
        self.date_changed.get(self.shared.as_ref()).unwrap_or(0)
    }

    /// Sets the last-change date.
    pub fn set_date_changed(&mut self, date: i64) {
        self.date_changed
            .set(date, AccessMode::Default, self.shared.as_ref());
    }

    /// Unread count (for conversation-like items).
    pub fn unread_count(&mut self) -> i32 {
        self.unread_count.get(self.shared.as_ref()).unwrap_or(0)
    }

    /// Sets the unread count.
    pub fn set_unread_count(&mut self, count: i32) {
        self.unread_count
            .set(count, AccessMode::Default, self.shared.as_ref());
    }

    /// Display color.
    pub fn color(&mut self) -> Color {
        self.color.get(self.shared.as_ref()).unwrap_or(Color::NONE)
    }

    /// Sets the display color.
    pub fn set_color(&mut self, color: Color, mode: AccessMode) {
        self.color.set(color, mode, self.shared.as_ref());
    }

    /// Access-control list, if one is present.
    pub fn rights(&mut self) -> Option<Acl> {
        self.rights.get(self.shared.as_ref())
    }

    /// Sets the access-control list.
    pub fn set_rights(&mut self, rights: Acl, mode: AccessMode) {
        self.rights.set(rights, mode, self.shared.as_ref());
    }

    /// Retention policy; absent means the default policy.
    pub fn retention_policy(&mut self) -> RetentionPolicy {
        self.retention.get(self.shared.as_ref()).unwrap_or_default()
    }

    /// Sets the retention policy.
    pub fn set_retention_policy(&mut self, policy: RetentionPolicy, mode: AccessMode) {
        self.retention.set(policy, mode, self.shared.as_ref());
    }

    /// Encoded item metadata.
    pub fn metadata(&mut self) -> Option<String> {
        self.metadata.get(self.shared.as_ref())
    }

    /// Records metadata that the caller has already persisted.
    ///
    /// Written `RemoteOnly` when shared state is attached: peers observe the
    /// persisted form, while the local copy was already updated by whoever
    /// produced it.
    pub fn record_saved_metadata(&mut self, metadata: String) {
        if self.shared.is_some() {
            self.metadata
                .set(metadata, AccessMode::RemoteOnly, self.shared.as_ref());
        } else {
            self.metadata.set(metadata, AccessMode::LocalOnly, None);
        }
    }
}

impl std::fmt::Debug for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemState")
            .field("item_id", &self.item_id)
            .field("shared", &self.shared.is_some())
            .finish_non_exhaustive()
    }
}
