//! Field-level local/shared synchronization.
//!
//! A [`SyncedField`] is one independently synchronizable named attribute of
//! mailbox or item state. Each field keeps a local value and, when a
//! [`SharedStateAccessor`] is attached, mirrors it into one field of a
//! backend hash. The authoritative value is the shared one whenever the
//! backend is attached and reachable; on backend failure reads degrade to
//! the local copy and the operation continues.

pub mod codec;
pub mod values;

use crate::error::CoreResult;
use crate::field::codec::FieldCodec;
use mailstate_backend::SharedStateBackend;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, error};

/// Policy selecting which representations a field write affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Update both the local copy and the shared backend.
    #[default]
    Default,
    /// Update only the local copy.
    LocalOnly,
    /// Update only the shared backend. Used when a peer-originated update
    /// must reach the backend without being re-published locally, and when
    /// warm-up pushes local state to a newly attached backend.
    RemoteOnly,
}

/// A backend handle bound to one hash key, giving a field bundle its remote
/// representation.
///
/// Cloning is cheap; clones address the same backing hash.
#[derive(Clone)]
pub struct SharedStateAccessor {
    backend: Arc<dyn SharedStateBackend>,
    key: String,
}

impl SharedStateAccessor {
    /// Creates an accessor for the hash at `key`.
    pub fn new(backend: Arc<dyn SharedStateBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }

    /// The backing hash key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads one field of the backing hash.
    pub fn get(&self, field: &str) -> CoreResult<Option<String>> {
        Ok(self.backend.hash_get(&self.key, field)?)
    }

    /// Writes one field of the backing hash.
    pub fn set(&self, field: &str, value: &str) -> CoreResult<()> {
        Ok(self.backend.hash_set(&self.key, field, value)?)
    }

    /// Atomically writes a field only if absent; returns the stored value.
    pub fn set_if_absent(&self, field: &str, value: &str) -> CoreResult<String> {
        Ok(self.backend.hash_set_nx(&self.key, field, value)?)
    }

    /// Removes one field of the backing hash.
    pub fn unset(&self, field: &str) -> CoreResult<()> {
        Ok(self.backend.hash_unset(&self.key, field)?)
    }

    /// Deletes the whole backing hash.
    pub fn delete(&self) -> CoreResult<()> {
        Ok(self.backend.delete(&self.key)?)
    }
}

impl std::fmt::Debug for SharedStateAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateAccessor")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// One named attribute with a local and an optional shared representation.
pub struct SyncedField<T> {
    name: Cow<'static, str>,
    local: Option<T>,
    codec: Box<dyn FieldCodec<T>>,
}

impl<T: Clone> SyncedField<T> {
    /// Creates an unset field.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        codec: impl FieldCodec<T> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            local: None,
            codec: Box::new(codec),
        }
    }

    /// Creates a field with an initial local value.
    pub fn with_initial(
        name: impl Into<Cow<'static, str>>,
        codec: impl FieldCodec<T> + 'static,
        value: T,
    ) -> Self {
        Self {
            name: name.into(),
            local: Some(value),
            codec: Box::new(codec),
        }
    }

    /// The field name, as used in the backing hash.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the authoritative value.
    ///
    /// With a shared accessor attached the remote value wins and the local
    /// copy is reconciled to match. An unreadable backend or a malformed
    /// payload degrades to the local copy; neither is an error here.
    pub fn get(&mut self, shared: Option<&SharedStateAccessor>) -> Option<T> {
        if let Some(accessor) = shared {
            match accessor.get(&self.name) {
                Ok(Some(wire)) => match self.codec.decode(&wire) {
                    Some(value) => {
                        self.local = Some(value.clone());
                        return Some(value);
                    }
                    None => {
                        error!(
                            "malformed shared value for field '{}' at {}: falling back to local",
                            self.name,
                            accessor.key()
                        );
                    }
                },
                // An absent hash field means the shared object was uncached;
                // the local copy is all we have.
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "unable to read field '{}' from backend, using local value: {e}",
                        self.name
                    );
                }
            }
        }
        self.local.clone()
    }

    /// Writes the field according to `mode`.
    ///
    /// A failed backend write is logged and the local write (if any) stands;
    /// field writes never fail the enclosing operation.
    pub fn set(&mut self, value: T, mode: AccessMode, shared: Option<&SharedStateAccessor>) {
        if mode != AccessMode::RemoteOnly {
            self.local = Some(value.clone());
        }
        if mode == AccessMode::LocalOnly {
            return;
        }
        let Some(accessor) = shared else {
            if mode == AccessMode::RemoteOnly {
                debug!("remote-only write to field '{}' with no accessor", self.name);
            }
            return;
        };
        let wire = self.codec.encode(&value);
        if let Err(e) = accessor.set(&self.name, &wire) {
            error!(
                "unable to write field '{}' to backend, local value still applied: {e}",
                self.name
            );
        }
    }

    /// Atomically initializes the shared field, adopting whichever value won.
    ///
    /// Either this caller's `value` is stored (first caller cluster-wide) or
    /// another node's value already exists; in both cases the returned value
    /// is adopted locally so every node converges on one origin value.
    pub fn set_if_not_exists(
        &mut self,
        value: T,
        shared: Option<&SharedStateAccessor>,
    ) -> CoreResult<T> {
        let Some(accessor) = shared else {
            let adopted = self.local.clone().unwrap_or(value);
            self.local = Some(adopted.clone());
            return Ok(adopted);
        };
        let stored = accessor.set_if_absent(&self.name, &self.codec.encode(&value))?;
        let adopted = match self.codec.decode(&stored) {
            Some(v) => v,
            None => {
                error!(
                    "malformed stored value for field '{}' during initialization, keeping ours",
                    self.name
                );
                value
            }
        };
        self.local = Some(adopted.clone());
        Ok(adopted)
    }

    /// Re-derives the local copy from the shared representation.
    ///
    /// Used before bit tests on bitmask-style fields, where several logical
    /// flags share one integer and a peer may have flipped any of them.
    pub fn refresh(&mut self, shared: Option<&SharedStateAccessor>) -> &mut Self {
        if let Some(accessor) = shared {
            match accessor.get(&self.name) {
                Ok(Some(wire)) => {
                    if let Some(value) = self.codec.decode(&wire) {
                        self.local = Some(value);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("unable to refresh field '{}': {e}", self.name);
                }
            }
        }
        self
    }

    /// Pushes a non-empty local value to a newly attached shared backend.
    ///
    /// Returns true if a value was published. One-time warm-up on first
    /// cluster-mode use.
    pub fn sync(&mut self, shared: &SharedStateAccessor) -> bool {
        match &self.local {
            Some(value) if self.codec.has_data(value) => {
                let value = value.clone();
                self.set(value, AccessMode::RemoteOnly, Some(shared));
                true
            }
            _ => false,
        }
    }

    /// Clears both representations.
    pub fn unset(&mut self, shared: Option<&SharedStateAccessor>) {
        self.local = None;
        if let Some(accessor) = shared {
            if let Err(e) = accessor.unset(&self.name) {
                error!("unable to unset field '{}' on backend: {e}", self.name);
            }
        }
    }

    /// The local copy, without consulting the backend.
    #[must_use]
    pub fn local(&self) -> Option<&T> {
        self.local.as_ref()
    }
}

impl<T> std::fmt::Debug for SyncedField<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedField")
            .field("name", &self.name)
            .field("set", &self.local.is_some())
            .finish_non_exhaustive()
    }
}
