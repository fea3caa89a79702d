//! Set-shaped transactional overlay.

use crate::error::CoreResult;
use crate::overlay::{Change, OverlayParticipant, TransactionTracker, Working};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Authoritative store behind a [`SetOverlay`].
pub trait SetBacking<T>: Send + Sync {
    /// Pulls the full authoritative member set.
    fn load(&self) -> CoreResult<HashSet<T>>;

    /// Applies one committed change.
    fn apply(&self, change: &Change<T, ()>) -> CoreResult<()>;
}

/// A shared set with per-thread buffered mutations.
///
/// Same transaction discipline as [`crate::overlay::MapOverlay`]: reads and
/// writes address the calling thread's working copy, mutations are buffered
/// until commit.
pub struct SetOverlay<T> {
    name: String,
    backing: Arc<dyn SetBacking<T>>,
    tracker: Arc<TransactionTracker>,
    local: Mutex<HashMap<ThreadId, Working<HashSet<T>, T, ()>>>,
    weak_self: Weak<SetOverlay<T>>,
}

impl<T> SetOverlay<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Creates an overlay over `backing`, registering with `tracker` on
    /// first use per transaction.
    pub fn new(
        name: impl Into<String>,
        backing: Arc<dyn SetBacking<T>>,
        tracker: Arc<TransactionTracker>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak_self| Self {
            name,
            backing,
            tracker,
            local: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    fn with_working<R>(
        &self,
        f: impl FnOnce(&mut Working<HashSet<T>, T, ()>) -> R,
    ) -> CoreResult<R> {
        let tid = thread::current().id();
        let mut local = self.local.lock();
        if !local.contains_key(&tid) {
            let data = self.backing.load()?;
            local.insert(tid, Working::new(data));
            if let Some(me) = self.weak_self.upgrade() {
                self.tracker.register(me);
            }
        }
        let working = local
            .get_mut(&tid)
            .unwrap_or_else(|| unreachable!("working copy inserted above"));
        Ok(f(working))
    }

    /// True if the member is present in the working copy.
    pub fn contains(&self, member: &T) -> CoreResult<bool> {
        self.with_working(|w| w.data.contains(member))
    }

    /// Number of members in the working copy.
    pub fn len(&self) -> CoreResult<usize> {
        self.with_working(|w| w.data.len())
    }

    /// True if the working copy is empty.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.with_working(|w| w.data.is_empty())
    }

    /// Clones the full working copy.
    pub fn members(&self) -> CoreResult<HashSet<T>> {
        self.with_working(|w| w.data.clone())
    }

    /// Adds one member; returns true if it was newly added.
    pub fn add(&self, member: T) -> CoreResult<bool> {
        self.with_working(|w| {
            let added = w.data.insert(member.clone());
            w.changes.push(Change::Add { member });
            added
        })
    }

    /// Adds a batch of members.
    pub fn add_all(&self, members: Vec<T>) -> CoreResult<()> {
        self.with_working(|w| {
            for member in &members {
                w.data.insert(member.clone());
            }
            w.changes.push(Change::AddAll { members });
        })
    }

    /// Removes one member; returns true if it was present.
    pub fn remove(&self, member: &T) -> CoreResult<bool> {
        self.with_working(|w| {
            let removed = w.data.remove(member);
            w.changes.push(Change::Remove {
                key: member.clone(),
            });
            removed
        })
    }

    /// Removes a batch of members.
    pub fn remove_all(&self, members: Vec<T>) -> CoreResult<()> {
        self.with_working(|w| {
            for member in &members {
                w.data.remove(member);
            }
            w.changes.push(Change::RemoveAll { members });
        })
    }

    /// Keeps only the listed members.
    pub fn retain_all(&self, members: Vec<T>) -> CoreResult<()> {
        self.with_working(|w| {
            let keep: HashSet<&T> = members.iter().collect();
            w.data.retain(|m| keep.contains(m));
            w.changes.push(Change::RetainAll { members });
        })
    }

    /// Removes every member.
    pub fn clear(&self) -> CoreResult<()> {
        self.with_working(|w| {
            w.data.clear();
            w.changes.push(Change::Clear);
        })
    }
}

impl<T> OverlayParticipant for SetOverlay<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn has_changes(&self) -> bool {
        self.local
            .lock()
            .get(&thread::current().id())
            .is_some_and(|w| !w.changes.is_empty())
    }

    fn flush_changes(&self) -> CoreResult<()> {
        let changes = self
            .local
            .lock()
            .get_mut(&thread::current().id())
            .map(|w| std::mem::take(&mut w.changes))
            .unwrap_or_default();
        for change in &changes {
            self.backing.apply(change)?;
        }
        Ok(())
    }

    fn clear_local(&self) {
        self.local.lock().remove(&thread::current().id());
    }
}

impl<T> std::fmt::Debug for SetOverlay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetOverlay")
            .field("name", &self.name)
            .field("threads", &self.local.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MemorySetBacking;

    fn overlay() -> (
        Arc<SetOverlay<String>>,
        Arc<MemorySetBacking<String>>,
        Arc<TransactionTracker>,
    ) {
        let backing = Arc::new(MemorySetBacking::new());
        let tracker = Arc::new(TransactionTracker::new());
        let overlay = SetOverlay::new(
            "tags",
            Arc::clone(&backing) as Arc<dyn SetBacking<String>>,
            Arc::clone(&tracker),
        );
        (overlay, backing, tracker)
    }

    #[test]
    fn buffered_add_visible_before_commit() {
        let (overlay, backing, _tracker) = overlay();
        overlay.add("urgent".to_owned()).unwrap();
        assert!(overlay.contains(&"urgent".to_owned()).unwrap());
        assert!(backing.snapshot().is_empty());
    }

    #[test]
    fn commit_replays_set_changes() {
        let (overlay, backing, tracker) = overlay();
        overlay
            .add_all(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
            .unwrap();
        overlay.remove(&"b".to_owned()).unwrap();

        tracker.commit_cache();

        let snapshot = backing.snapshot();
        assert!(snapshot.contains("a"));
        assert!(!snapshot.contains("b"));
        assert!(snapshot.contains("c"));
    }

    #[test]
    fn retain_all_keeps_only_listed_members() {
        let (overlay, backing, tracker) = overlay();
        backing.insert("a".to_owned());
        backing.insert("b".to_owned());
        backing.insert("c".to_owned());

        overlay
            .retain_all(vec!["a".to_owned(), "c".to_owned()])
            .unwrap();
        assert_eq!(overlay.len().unwrap(), 2);

        tracker.commit_cache();
        let snapshot = backing.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.contains("b"));
    }

    #[test]
    fn remove_all_and_clear_replay() {
        let (overlay, backing, tracker) = overlay();
        backing.insert("x".to_owned());

        overlay.add("y".to_owned()).unwrap();
        overlay.remove_all(vec!["x".to_owned()]).unwrap();
        tracker.commit_cache();
        assert_eq!(backing.snapshot(), HashSet::from(["y".to_owned()]));

        overlay.clear().unwrap();
        tracker.commit_cache();
        assert!(backing.snapshot().is_empty());
    }

    #[test]
    fn rollback_leaves_backing_untouched() {
        let (overlay, backing, tracker) = overlay();
        backing.insert("keep".to_owned());

        overlay.clear().unwrap();
        overlay.add("junk".to_owned()).unwrap();
        tracker.rollback_cache();

        assert_eq!(backing.snapshot(), HashSet::from(["keep".to_owned()]));
        // Fresh pull observes the authoritative state again.
        assert!(overlay.contains(&"keep".to_owned()).unwrap());
        assert!(!overlay.contains(&"junk".to_owned()).unwrap());
    }
}
