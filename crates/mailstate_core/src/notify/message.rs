//! Notification wire format.

use crate::error::{CoreError, CoreResult};
use crate::types::{ItemId, MailboxId, SessionId};
use serde::{Deserialize, Serialize};

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The item was created.
    Created,
    /// The item was modified.
    Modified,
    /// The item was deleted.
    Deleted,
}

/// One item-level entry in a committed change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChange {
    /// The affected item.
    pub item_id: ItemId,
    /// What happened to it.
    pub kind: ChangeKind,
    /// Bitmask of which attributes changed; opaque to this layer.
    pub reason: u32,
}

/// A committed change set, as delivered to listeners and published to the
/// cluster.
///
/// `origin_hash` identifies the mailbox instance (process + mailbox) the
/// change originated from and `source` the originating session; receivers
/// use both to suppress duplicate delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// The mailbox the changes belong to.
    pub mailbox_id: MailboxId,
    /// The change sequence id assigned at commit.
    pub change_id: u64,
    /// The item-level changes, in commit order.
    pub changes: Vec<ItemChange>,
    /// The session that performed the transaction, if any.
    pub source: Option<SessionId>,
    /// Opaque hash of the originating mailbox instance.
    pub origin_hash: u64,
}

impl ChangeNotification {
    /// True if the change set carries no item changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Serializes for the shared channel.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| CoreError::malformed_notification(e.to_string()))?;
        Ok(buf)
    }

    /// Deserializes a payload received from the shared channel.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedNotification`] for undecodable
    /// payloads; the receiver logs and drops them.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| CoreError::malformed_notification(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChangeNotification {
        ChangeNotification {
            mailbox_id: MailboxId::new(7),
            change_id: 42,
            changes: vec![
                ItemChange {
                    item_id: ItemId::new(100),
                    kind: ChangeKind::Created,
                    reason: 0b11,
                },
                ItemChange {
                    item_id: ItemId::new(101),
                    kind: ChangeKind::Deleted,
                    reason: 0,
                },
            ],
            source: Some(SessionId::new()),
            origin_hash: 0xdead_beef,
        }
    }

    #[test]
    fn wire_roundtrip() {
        let notification = sample();
        let bytes = notification.encode().unwrap();
        let decoded = ChangeNotification::decode(&bytes).unwrap();
        assert_eq!(decoded, notification);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let result = ChangeNotification::decode(b"not cbor at all \xff\xff");
        assert!(matches!(
            result,
            Err(CoreError::MalformedNotification { .. })
        ));
    }

    #[test]
    fn empty_change_set_is_empty() {
        let mut notification = sample();
        notification.changes.clear();
        assert!(notification.is_empty());
    }
}
