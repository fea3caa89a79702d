//! Core type definitions for the coordination layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier scoping locks, state, counters and notifications to one
/// logical mailbox.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MailboxId(pub u64);

impl MailboxId {
    /// Creates a new mailbox id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mbox:{}", self.0)
    }
}

/// Identifier for one mail item within a mailbox.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ItemId(pub u64);

impl ItemId {
    /// Creates a new item id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item:{}", self.0)
    }
}

/// Identifier for a listener session attached to a mailbox.
///
/// Session ids travel inside cluster notifications so that the originating
/// session is never redelivered its own change set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Creates a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Creates a session id from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", Uuid::from_bytes(self.0))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

/// The named monotonic counters kept per mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterKind {
    /// Next item id.
    Item,
    /// Next saved-search id.
    Search,
    /// Next change sequence id.
    Change,
}

impl CounterKind {
    /// All counter kinds, in a stable order.
    pub const ALL: [CounterKind; 3] = [CounterKind::Item, CounterKind::Search, CounterKind::Change];

    /// Stable name used in backend keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CounterKind::Item => "item",
            CounterKind::Search => "search",
            CounterKind::Change => "change",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_id_ordering_and_display() {
        assert!(MailboxId::new(1) < MailboxId::new(2));
        assert_eq!(format!("{}", MailboxId::new(7)), "mbox:7");
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn counter_kind_names_are_stable() {
        assert_eq!(CounterKind::Item.as_str(), "item");
        assert_eq!(CounterKind::Search.as_str(), "search");
        assert_eq!(CounterKind::Change.as_str(), "change");
    }
}
