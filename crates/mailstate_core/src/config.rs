//! Store configuration.

use std::time::Duration;

/// Configuration for constructing a [`crate::store::MailboxStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of shared notification channels mailboxes are sharded over.
    pub channel_count: u64,

    /// How long a thread blocks waiting for a mailbox lock before the
    /// acquisition fails.
    pub lock_timeout: Duration,

    /// Maximum number of threads allowed to queue on one mailbox lock;
    /// past this bound acquisition fails fast.
    pub max_lock_waiters: usize,

    /// Maximum number of items kept in each per-mailbox item cache.
    pub item_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            channel_count: 16,
            lock_timeout: Duration::from_secs(30),
            max_lock_waiters: 64,
            item_cache_size: 512,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the notification channel count.
    #[must_use]
    pub const fn channel_count(mut self, count: u64) -> Self {
        self.channel_count = count;
        self
    }

    /// Sets the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the lock waiter bound.
    #[must_use]
    pub const fn max_lock_waiters(mut self, waiters: usize) -> Self {
        self.max_lock_waiters = waiters;
        self
    }

    /// Sets the per-mailbox item cache size.
    #[must_use]
    pub const fn item_cache_size(mut self, size: usize) -> Self {
        self.item_cache_size = size;
        self
    }
}
