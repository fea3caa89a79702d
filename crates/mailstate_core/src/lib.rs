//! # Mailstate Core
//!
//! Clustered-state coordination for a multi-tenant mail store: lets one
//! logical mailbox be operated on safely by worker processes on different
//! cluster nodes.
//!
//! This crate provides:
//! - Synchronized fields with local and shared-backend representations
//! - Item and mailbox state bundles built from those fields
//! - Transactional cache overlays with per-thread buffered mutations
//! - Reentrant per-mailbox locks and maintenance windows
//! - Distributed monotonic ID allocation
//! - Change-notification publish/subscribe with channel sharding
//!
//! Mail semantics (folders, tags, message parsing, persistence) live
//! elsewhere and are consumed through the narrow collaborator traits in
//! [`cache`] and the backend contract in `mailstate_backend`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod field;
pub mod ids;
pub mod lock;
pub mod notify;
pub mod overlay;
pub mod state;
pub mod store;
pub mod types;

pub use cache::{CachedItem, ItemCache, ItemDataStore};
pub use config::StoreConfig;
pub use error::{CoreError, CoreResult};
pub use field::{AccessMode, SharedStateAccessor, SyncedField};
pub use ids::{IdAllocator, LocalIdAllocator, SharedIdAllocator};
pub use lock::maintenance::MaintenanceWindows;
pub use lock::{LockGuard, LockManager};
pub use notify::{
    ChangeKind, ChangeNotification, ItemChange, ListenerKind, NotificationHub, Publisher,
    SessionListener, Subscriber,
};
pub use overlay::{
    Change, DropOldest, EvictionStrategy, LruOverlay, MapOverlay, OverlayParticipant, SetOverlay,
    TransactionTracker,
};
pub use state::{ItemFlag, ItemState, MailboxCounterStore, MailboxCounters, MailboxState};
pub use store::MailboxStore;
pub use types::{CounterKind, ItemId, MailboxId, SessionId};
