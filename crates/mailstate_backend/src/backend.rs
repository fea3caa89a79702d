//! Shared-state backend trait definition.

use crate::error::BackendResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Lock mode for a distributed mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexMode {
    /// Multiple holders allowed concurrently.
    Shared,
    /// Single holder cluster-wide.
    Exclusive,
}

/// Proof of mutex ownership, passed back on release.
///
/// Handles are not reentrant: each successful acquire returns a distinct
/// handle and each handle must be released exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexHandle {
    /// Name of the held mutex.
    pub name: String,
    /// Mode the mutex was acquired in.
    pub mode: MutexMode,
    /// Opaque ownership token.
    pub token: u64,
}

/// Identifier for a topic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Callback invoked with each message published to a subscribed topic.
pub type TopicListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A cross-process shared-state store.
///
/// Backends are **opaque keyed stores**: scalars, named-field hashes, atomic
/// counters, distributed mutexes and pub/sub topics. The coordination layer
/// owns all key naming and value interpretation - backends do not understand
/// mailboxes, fields or notifications.
///
/// # Invariants
///
/// - `hash_set_nx` and `check_and_init` are atomic: concurrent callers always
///   observe one winner's value, never a torn initialization
/// - `counter_add` never loses updates under concurrency
/// - at most one `Exclusive` holder per mutex name cluster-wide at a time
/// - `publish` delivers to every currently-connected subscriber of the topic
///   at least once; there is no replay for late subscribers
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryBackend`] - in-process reference implementation
/// - Any Redis-compatible store offers equivalent primitives and can be
///   adapted behind this trait
pub trait SharedStateBackend: Send + Sync {
    /// Checks backend liveness.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable. Callers that cannot
    /// operate without the backend (the cluster lock factory) treat this as
    /// fatal.
    fn ping(&self) -> BackendResult<()>;

    /// Reads a scalar value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-scalar value.
    fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Writes a scalar value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-scalar value.
    fn set(&self, key: &str, value: &str) -> BackendResult<()>;

    /// Deletes a key of any kind. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    fn delete(&self, key: &str) -> BackendResult<()>;

    /// Reads one field of a named-field hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-hash value.
    fn hash_get(&self, key: &str, field: &str) -> BackendResult<Option<String>>;

    /// Writes one field of a named-field hash, creating the hash if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-hash value.
    fn hash_set(&self, key: &str, field: &str, value: &str) -> BackendResult<()>;

    /// Atomically writes a hash field only if it is absent.
    ///
    /// Returns the value stored after the call: `value` if this caller won,
    /// or the previously stored value if another caller got there first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-hash value.
    fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> BackendResult<String>;

    /// Removes one field from a hash. Removing an absent field is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-hash value.
    fn hash_unset(&self, key: &str, field: &str) -> BackendResult<()>;

    /// Reads a whole hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-hash value.
    fn hash_get_all(&self, key: &str) -> BackendResult<HashMap<String, String>>;

    /// Atomically adds `delta` to a counter, creating it at zero first if
    /// absent. Returns the post-add value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-counter value.
    fn counter_add(&self, key: &str, delta: i64) -> BackendResult<i64>;

    /// Reads a counter. An absent counter reads as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-counter value.
    fn counter_get(&self, key: &str) -> BackendResult<i64>;

    /// Atomically initializes a counter to `value` if absent, or reads the
    /// existing value. One round trip, true compare-and-set semantics:
    /// concurrent initializers always converge on a single winner.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the key holds a
    /// non-counter value.
    fn check_and_init(&self, key: &str, value: i64) -> BackendResult<i64>;

    /// Acquires a distributed mutex, blocking up to `wait`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::MutexTimeout`] if the mutex could not
    /// be acquired within the wait bound, or an unavailability error if the
    /// backend is unreachable.
    fn mutex_acquire(
        &self,
        name: &str,
        mode: MutexMode,
        wait: Duration,
    ) -> BackendResult<MutexHandle>;

    /// Releases a previously acquired mutex.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::MutexNotHeld`] if the handle no longer
    /// owns the mutex.
    fn mutex_release(&self, handle: &MutexHandle) -> BackendResult<()>;

    /// Publishes a payload to a topic.
    ///
    /// Delivery is at-least-once to currently-connected subscribers;
    /// publishing to a topic with no subscribers is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    fn publish(&self, topic: &str, payload: &[u8]) -> BackendResult<()>;

    /// Attaches a listener to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    fn subscribe(&self, topic: &str, listener: TopicListener) -> BackendResult<SubscriptionId>;

    /// Detaches a previously attached listener.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::UnknownSubscription`] if the id is not
    /// a live subscription.
    fn unsubscribe(&self, id: SubscriptionId) -> BackendResult<()>;
}
