//! Typed bundles of synchronized fields.

mod item;
mod mailbox;

pub use item::{ItemFlag, ItemState};
pub use mailbox::{MailboxCounterStore, MailboxCounters, MailboxState};
