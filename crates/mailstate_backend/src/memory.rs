//! In-process shared-state backend.

use crate::backend::{
    MutexHandle, MutexMode, SharedStateBackend, SubscriptionId, TopicListener,
};
use crate::error::{BackendError, BackendResult};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One stored value; each key holds exactly one kind.
#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Hash(HashMap<String, String>),
    Counter(i64),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Hash(_) => "hash",
            Value::Counter(_) => "counter",
        }
    }
}

#[derive(Debug, Default)]
struct MutexState {
    exclusive: Option<u64>,
    shared: HashSet<u64>,
}

#[derive(Default)]
struct Subscriptions {
    by_topic: HashMap<String, Vec<(u64, TopicListener)>>,
    topic_of: HashMap<u64, String>,
}

/// An in-process shared-state backend.
///
/// All state lives in memory behind one instance. Sharing a single
/// `Arc<MemoryBackend>` between several stores makes them behave like
/// cluster nodes against one coordination service, which is how the
/// integration tests exercise cross-node semantics. This backend is suitable
/// for:
/// - Unit and integration tests
/// - Single-process deployments that still want the full backend contract
///
/// # Thread Safety
///
/// The backend is thread-safe; mutex acquisition blocks on a condition
/// variable rather than spinning.
///
/// # Fault injection
///
/// [`MemoryBackend::set_offline`] makes every subsequent operation fail with
/// an unavailability error, which is how degraded-mode behavior is tested.
#[derive(Default)]
pub struct MemoryBackend {
    values: RwLock<HashMap<String, Value>>,
    mutexes: Mutex<HashMap<String, MutexState>>,
    mutex_cond: Condvar,
    subs: RwLock<Subscriptions>,
    next_token: AtomicU64,
    offline: AtomicBool,
}

impl MemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the backend becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Returns the number of live topic subscriptions, across all topics.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subs.read().topic_of.len()
    }

    fn check_online(&self) -> BackendResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BackendError::unavailable("backend marked offline"))
        } else {
            Ok(())
        }
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    fn wrong_kind(key: &str, found: &Value, wanted: &str) -> BackendError {
        BackendError::wrong_kind(key, format!("holds {}, wanted {wanted}", found.kind()))
    }
}

impl SharedStateBackend for MemoryBackend {
    fn ping(&self) -> BackendResult<()> {
        self.check_online()
    }

    fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.check_online()?;
        match self.values.read().get(key) {
            None => Ok(None),
            Some(Value::Scalar(s)) => Ok(Some(s.clone())),
            Some(other) => Err(Self::wrong_kind(key, other, "scalar")),
        }
    }

    fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.check_online()?;
        let mut values = self.values.write();
        match values.get(key) {
            None | Some(Value::Scalar(_)) => {
                values.insert(key.to_owned(), Value::Scalar(value.to_owned()));
                Ok(())
            }
            Some(other) => Err(Self::wrong_kind(key, other, "scalar")),
        }
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        self.check_online()?;
        self.values.write().remove(key);
        Ok(())
    }

    fn hash_get(&self, key: &str, field: &str) -> BackendResult<Option<String>> {
        self.check_online()?;
        match self.values.read().get(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(other) => Err(Self::wrong_kind(key, other, "hash")),
        }
    }

    fn hash_set(&self, key: &str, field: &str, value: &str) -> BackendResult<()> {
        self.check_online()?;
        let mut values = self.values.write();
        match values
            .entry(key.to_owned())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(h) => {
                h.insert(field.to_owned(), value.to_owned());
                Ok(())
            }
            other => Err(Self::wrong_kind(key, other, "hash")),
        }
    }

    fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> BackendResult<String> {
        self.check_online()?;
        let mut values = self.values.write();
        match values
            .entry(key.to_owned())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(h) => Ok(h
                .entry(field.to_owned())
                .or_insert_with(|| value.to_owned())
                .clone()),
            other => Err(Self::wrong_kind(key, other, "hash")),
        }
    }

    fn hash_unset(&self, key: &str, field: &str) -> BackendResult<()> {
        self.check_online()?;
        let mut values = self.values.write();
        match values.get_mut(key) {
            None => Ok(()),
            Some(Value::Hash(h)) => {
                h.remove(field);
                Ok(())
            }
            Some(other) => Err(Self::wrong_kind(key, other, "hash")),
        }
    }

    fn hash_get_all(&self, key: &str) -> BackendResult<HashMap<String, String>> {
        self.check_online()?;
        match self.values.read().get(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(other) => Err(Self::wrong_kind(key, other, "hash")),
        }
    }

    fn counter_add(&self, key: &str, delta: i64) -> BackendResult<i64> {
        self.check_online()?;
        let mut values = self.values.write();
        match values
            .entry(key.to_owned())
            .or_insert_with(|| Value::Counter(0))
        {
            Value::Counter(c) => {
                *c += delta;
                Ok(*c)
            }
            other => Err(Self::wrong_kind(key, other, "counter")),
        }
    }

    fn counter_get(&self, key: &str) -> BackendResult<i64> {
        self.check_online()?;
        match self.values.read().get(key) {
            None => Ok(0),
            Some(Value::Counter(c)) => Ok(*c),
            Some(other) => Err(Self::wrong_kind(key, other, "counter")),
        }
    }

    fn check_and_init(&self, key: &str, value: i64) -> BackendResult<i64> {
        self.check_online()?;
        let mut values = self.values.write();
        match values
            .entry(key.to_owned())
            .or_insert_with(|| Value::Counter(value))
        {
            Value::Counter(c) => Ok(*c),
            other => Err(Self::wrong_kind(key, other, "counter")),
        }
    }

    fn mutex_acquire(
        &self,
        name: &str,
        mode: MutexMode,
        wait: Duration,
    ) -> BackendResult<MutexHandle> {
        self.check_online()?;
        let token = self.token();
        let deadline = Instant::now() + wait;
        let mut mutexes = self.mutexes.lock();
        loop {
            let state = mutexes.entry(name.to_owned()).or_default();
            let free = match mode {
                MutexMode::Exclusive => state.exclusive.is_none() && state.shared.is_empty(),
                MutexMode::Shared => state.exclusive.is_none(),
            };
            if free {
                match mode {
                    MutexMode::Exclusive => state.exclusive = Some(token),
                    MutexMode::Shared => {
                        state.shared.insert(token);
                    }
                }
                return Ok(MutexHandle {
                    name: name.to_owned(),
                    mode,
                    token,
                });
            }
            if self
                .mutex_cond
                .wait_until(&mut mutexes, deadline)
                .timed_out()
            {
                return Err(BackendError::MutexTimeout {
                    name: name.to_owned(),
                });
            }
        }
    }

    fn mutex_release(&self, handle: &MutexHandle) -> BackendResult<()> {
        self.check_online()?;
        let mut mutexes = self.mutexes.lock();
        let held = match mutexes.get_mut(&handle.name) {
            Some(state) => match handle.mode {
                MutexMode::Exclusive => {
                    if state.exclusive == Some(handle.token) {
                        state.exclusive = None;
                        true
                    } else {
                        false
                    }
                }
                MutexMode::Shared => state.shared.remove(&handle.token),
            },
            None => false,
        };
        if !held {
            return Err(BackendError::MutexNotHeld {
                name: handle.name.clone(),
            });
        }
        self.mutex_cond.notify_all();
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> BackendResult<()> {
        self.check_online()?;
        // Clone the listener list so delivery runs outside the lock; a
        // listener may itself subscribe or publish.
        let listeners: Vec<TopicListener> = self
            .subs
            .read()
            .by_topic
            .get(topic)
            .map(|l| l.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(payload);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, listener: TopicListener) -> BackendResult<SubscriptionId> {
        self.check_online()?;
        let id = self.token();
        let mut subs = self.subs.write();
        subs.by_topic
            .entry(topic.to_owned())
            .or_default()
            .push((id, listener));
        subs.topic_of.insert(id, topic.to_owned());
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> BackendResult<()> {
        self.check_online()?;
        let mut subs = self.subs.write();
        let topic = subs
            .topic_of
            .remove(&id.0)
            .ok_or(BackendError::UnknownSubscription { id: id.0 })?;
        if let Some(listeners) = subs.by_topic.get_mut(&topic) {
            listeners.retain(|(sid, _)| *sid != id.0);
            if listeners.is_empty() {
                subs.by_topic.remove(&topic);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("keys", &self.values.read().len())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
