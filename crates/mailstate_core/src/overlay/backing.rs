//! Backing-store implementations for the transactional overlays.
//!
//! Local-mode deployments back overlays with plain in-process collections;
//! cluster mode backs them with a hash in the shared backend so every node
//! observes committed changes.

use crate::error::{CoreError, CoreResult};
use crate::overlay::{Change, MapBacking, SetBacking};
use mailstate_backend::SharedStateBackend;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

/// In-process map backing.
#[derive(Debug, Default)]
pub struct MemoryMapBacking<K, V> {
    data: Mutex<HashMap<K, V>>,
}

impl<K, V> MemoryMapBacking<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty backing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts directly into the authoritative map, bypassing any overlay.
    pub fn insert(&self, key: K, value: V) {
        self.data.lock().insert(key, value);
    }

    /// Clones the authoritative map.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.data.lock().clone()
    }
}

impl<K, V> MapBacking<K, V> for MemoryMapBacking<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn load(&self) -> CoreResult<HashMap<K, V>> {
        Ok(self.snapshot())
    }

    fn apply(&self, change: &Change<K, V>) -> CoreResult<()> {
        let mut data = self.data.lock();
        match change {
            Change::Put { key, value } => {
                data.insert(key.clone(), value.clone());
            }
            Change::PutAll { entries } => {
                for (key, value) in entries {
                    data.insert(key.clone(), value.clone());
                }
            }
            Change::Remove { key } => {
                data.remove(key);
            }
            Change::Clear => data.clear(),
            other => {
                return Err(CoreError::invalid_operation(format!(
                    "change {other:?} does not apply to a map backing"
                )))
            }
        }
        Ok(())
    }
}

/// In-process set backing.
#[derive(Debug, Default)]
pub struct MemorySetBacking<T> {
    data: Mutex<HashSet<T>>,
}

impl<T> MemorySetBacking<T>
where
    T: Eq + Hash + Clone,
{
    /// Creates an empty backing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashSet::new()),
        }
    }

    /// Inserts directly into the authoritative set, bypassing any overlay.
    pub fn insert(&self, member: T) {
        self.data.lock().insert(member);
    }

    /// Clones the authoritative set.
    #[must_use]
    pub fn snapshot(&self) -> HashSet<T> {
        self.data.lock().clone()
    }
}

impl<T> SetBacking<T> for MemorySetBacking<T>
where
    T: Eq + Hash + Clone + Send + Sync,
{
    fn load(&self) -> CoreResult<HashSet<T>> {
        Ok(self.snapshot())
    }

    fn apply(&self, change: &Change<T, ()>) -> CoreResult<()> {
        let mut data = self.data.lock();
        match change {
            Change::Add { member } => {
                data.insert(member.clone());
            }
            Change::AddAll { members } => {
                for member in members {
                    data.insert(member.clone());
                }
            }
            Change::Remove { key } => {
                data.remove(key);
            }
            Change::RemoveAll { members } => {
                for member in members {
                    data.remove(member);
                }
            }
            Change::RetainAll { members } => {
                let keep: HashSet<&T> = members.iter().collect();
                data.retain(|m| keep.contains(m));
            }
            Change::Clear => data.clear(),
            other => {
                return Err(CoreError::invalid_operation(format!(
                    "change {other:?} does not apply to a set backing"
                )))
            }
        }
        Ok(())
    }
}

/// Map backing stored as one hash in the shared backend.
pub struct SharedHashMapBacking {
    backend: Arc<dyn SharedStateBackend>,
    key: String,
}

impl SharedHashMapBacking {
    /// Creates a backing over the hash at `key`.
    pub fn new(backend: Arc<dyn SharedStateBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }
}

impl MapBacking<String, String> for SharedHashMapBacking {
    fn load(&self) -> CoreResult<HashMap<String, String>> {
        Ok(self.backend.hash_get_all(&self.key)?)
    }

    fn apply(&self, change: &Change<String, String>) -> CoreResult<()> {
        match change {
            Change::Put { key, value } => self.backend.hash_set(&self.key, key, value)?,
            Change::PutAll { entries } => {
                for (key, value) in entries {
                    self.backend.hash_set(&self.key, key, value)?;
                }
            }
            Change::Remove { key } => self.backend.hash_unset(&self.key, key)?,
            Change::Clear => self.backend.delete(&self.key)?,
            other => {
                return Err(CoreError::invalid_operation(format!(
                    "change {other:?} does not apply to a map backing"
                )))
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedHashMapBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHashMapBacking")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Set backing stored as a hash with empty values in the shared backend.
///
/// The backend contract has no native set type; members are hash fields and
/// the values are empty strings.
pub struct SharedHashSetBacking {
    backend: Arc<dyn SharedStateBackend>,
    key: String,
}

impl SharedHashSetBacking {
    /// Creates a backing over the hash at `key`.
    pub fn new(backend: Arc<dyn SharedStateBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }
}

impl SetBacking<String> for SharedHashSetBacking {
    fn load(&self) -> CoreResult<HashSet<String>> {
        Ok(self.backend.hash_get_all(&self.key)?.into_keys().collect())
    }

    fn apply(&self, change: &Change<String, ()>) -> CoreResult<()> {
        match change {
            Change::Add { member } => self.backend.hash_set(&self.key, member, "")?,
            Change::AddAll { members } => {
                for member in members {
                    self.backend.hash_set(&self.key, member, "")?;
                }
            }
            Change::Remove { key } => self.backend.hash_unset(&self.key, key)?,
            Change::RemoveAll { members } => {
                for member in members {
                    self.backend.hash_unset(&self.key, member)?;
                }
            }
            Change::RetainAll { members } => {
                let keep: HashSet<&String> = members.iter().collect();
                for member in self.backend.hash_get_all(&self.key)?.into_keys() {
                    if !keep.contains(&member) {
                        self.backend.hash_unset(&self.key, &member)?;
                    }
                }
            }
            Change::Clear => self.backend.delete(&self.key)?,
            other => {
                return Err(CoreError::invalid_operation(format!(
                    "change {other:?} does not apply to a set backing"
                )))
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedHashSetBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHashSetBacking")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
