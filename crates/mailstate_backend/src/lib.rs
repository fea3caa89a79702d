//! # Mailstate Backend
//!
//! Shared-state backend contract for the mailstate coordination layer.
//!
//! This crate provides:
//! - The [`SharedStateBackend`] trait: scalars, named-field hashes, atomic
//!   counters, distributed mutexes and pub/sub topics
//! - [`MemoryBackend`], the in-process reference implementation
//!
//! The backend is the single cluster-wide arbiter per key: any store offering
//! these primitives (the reference deployment target is a Redis-compatible
//! store) can be adapted behind the trait without touching the layers above.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;

pub use backend::{
    MutexHandle, MutexMode, SharedStateBackend, SubscriptionId, TopicListener,
};
pub use error::{BackendError, BackendResult};
pub use memory::MemoryBackend;
