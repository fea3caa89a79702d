//! Change notification publish/subscribe.
//!
//! After a mailbox transaction commits, its change set is delivered to every
//! interested listener: local sessions synchronously, then - in cluster mode
//! and only for non-empty change sets - the rest of the cluster through a
//! shared channel. Mailboxes shard onto `channel_count` channels by
//! `mailbox_id mod N`, bounding the number of cluster subscriptions a
//! process holds regardless of mailbox count.

mod message;

pub use message::{ChangeKind, ChangeNotification, ItemChange};

use crate::error::CoreResult;
use crate::types::{MailboxId, SessionId};
use mailstate_backend::{SharedStateBackend, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use tracing::{debug, error};
use uuid::Uuid;

/// Coarse classification of listener sessions, for filtered lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// A session with a user actively attached.
    Interactive,
    /// A session parked waiting for changes.
    Waiting,
    /// An internal consumer (indexer, replicator).
    System,
}

/// A listener session attached to one mailbox.
pub trait SessionListener: Send + Sync {
    /// The session's identity.
    fn session_id(&self) -> SessionId;

    /// The session's kind.
    fn kind(&self) -> ListenerKind;

    /// Delivers one committed change set.
    fn notify(&self, notification: &ChangeNotification);

    /// Force-disconnects the session; called when its mailbox enters
    /// maintenance.
    fn disconnect(&self);
}

/// Registry of listener sessions for one mailbox.
pub struct Subscriber {
    mailbox_id: MailboxId,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl Subscriber {
    fn new(mailbox_id: MailboxId) -> Self {
        Self {
            mailbox_id,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The mailbox this registry serves.
    #[must_use]
    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox_id
    }

    /// Registers a listener session.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes a listener session; returns true if it was registered.
    pub fn remove_listener(&self, session_id: SessionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.session_id() != session_id);
        listeners.len() != before
    }

    /// The registered listeners of one kind.
    #[must_use]
    pub fn listeners_of_kind(&self, kind: ListenerKind) -> Vec<Arc<dyn SessionListener>> {
        self.listeners
            .read()
            .iter()
            .filter(|l| l.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn num_listeners(&self) -> usize {
        self.listeners.read().len()
    }

    /// Force-disconnects and removes every listener. Used when the mailbox
    /// enters maintenance.
    pub fn purge_listeners(&self) {
        let purged: Vec<_> = std::mem::take(&mut *self.listeners.write());
        for listener in &purged {
            listener.disconnect();
        }
    }

    fn notify_all(&self, notification: &ChangeNotification, skip: Option<SessionId>) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            if skip.is_some_and(|id| listener.session_id() == id) {
                continue;
            }
            listener.notify(notification);
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("mailbox_id", &self.mailbox_id)
            .field("listeners", &self.num_listeners())
            .finish_non_exhaustive()
    }
}

struct RemoteChannel {
    backend: Arc<dyn SharedStateBackend>,
    topic: String,
}

/// Publishes committed change sets for one mailbox.
pub struct Publisher {
    mailbox_id: MailboxId,
    subscriber: Arc<Subscriber>,
    origin_hash: u64,
    remote: Option<RemoteChannel>,
}

impl Publisher {
    /// Delivers a committed change set.
    ///
    /// Local subscribers are always notified, synchronously and first - even
    /// for an empty change set. The cluster channel is only published to
    /// when the change set is non-empty; a failed remote publish is logged
    /// and does not undo the already-completed local delivery.
    pub fn publish(
        &self,
        changes: Vec<ItemChange>,
        change_id: u64,
        source: Option<SessionId>,
    ) -> CoreResult<()> {
        let notification = ChangeNotification {
            mailbox_id: self.mailbox_id,
            change_id,
            changes,
            source,
            origin_hash: self.origin_hash,
        };
        self.subscriber.notify_all(&notification, None);
        if notification.is_empty() {
            debug!("skipping remote publish of empty change set for {}", self.mailbox_id);
            return Ok(());
        }
        if let Some(remote) = &self.remote {
            let payload = notification.encode()?;
            if let Err(e) = remote.backend.publish(&remote.topic, &payload) {
                error!(
                    "failed to publish change {} for {} to cluster: {e}",
                    change_id, self.mailbox_id
                );
            }
        }
        Ok(())
    }

    /// Number of listeners that receive this publisher's notifications
    /// locally.
    #[must_use]
    pub fn num_listeners(&self) -> usize {
        self.subscriber.num_listeners()
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("mailbox_id", &self.mailbox_id)
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

struct ChannelAttachment {
    subscription: SubscriptionId,
    mailboxes: usize,
}

/// Per-process notification fan-out.
///
/// Owns the mailbox [`Subscriber`] registries, builds [`Publisher`]s, and in
/// cluster mode manages the shared channel subscriptions: a channel listener
/// is attached when the first subscriber in its shard registers and detached
/// when the last one is dropped.
pub struct NotificationHub {
    backend: Option<Arc<dyn SharedStateBackend>>,
    channel_count: u64,
    node_id: u64,
    subscribers: Mutex<HashMap<MailboxId, Arc<Subscriber>>>,
    channels: Mutex<HashMap<u64, ChannelAttachment>>,
    weak_self: Weak<NotificationHub>,
}

impl NotificationHub {
    /// Creates a local-only hub: no remote fan-out at all.
    #[must_use]
    pub fn local(channel_count: u64) -> Arc<Self> {
        Self::build(None, channel_count)
    }

    /// Creates a cluster hub over the shared backend.
    #[must_use]
    pub fn clustered(backend: Arc<dyn SharedStateBackend>, channel_count: u64) -> Arc<Self> {
        Self::build(Some(backend), channel_count)
    }

    fn build(backend: Option<Arc<dyn SharedStateBackend>>, channel_count: u64) -> Arc<Self> {
        let node_id = u64::from_be_bytes(
            Uuid::new_v4().into_bytes()[..8]
                .try_into()
                .unwrap_or([0; 8]),
        );
        Arc::new_cyclic(|weak_self| Self {
            backend,
            channel_count: channel_count.max(1),
            node_id,
            subscribers: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// The channel shard a mailbox routes through.
    #[must_use]
    pub fn channel_index(&self, mailbox_id: MailboxId) -> u64 {
        mailbox_id.as_u64() % self.channel_count
    }

    fn topic(&self, index: u64) -> String {
        format!("notify:{index}")
    }

    /// Opaque hash identifying this process's instance of a mailbox.
    #[must_use]
    pub fn origin_hash(&self, mailbox_id: MailboxId) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.node_id.hash(&mut hasher);
        mailbox_id.hash(&mut hasher);
        hasher.finish()
    }

    /// The subscriber registry for a mailbox, creating it on first use.
    ///
    /// In cluster mode, creating the first subscriber in a shard attaches
    /// the process to that shard's shared channel.
    pub fn subscriber(&self, mailbox_id: MailboxId) -> CoreResult<Arc<Subscriber>> {
        {
            let mut subscribers = self.subscribers.lock();
            if let Some(existing) = subscribers.get(&mailbox_id) {
                return Ok(Arc::clone(existing));
            }
            subscribers.insert(mailbox_id, Arc::new(Subscriber::new(mailbox_id)));
        }
        if let Err(e) = self.attach_channel(mailbox_id) {
            self.subscribers.lock().remove(&mailbox_id);
            return Err(e);
        }
        Ok(Arc::clone(
            self.subscribers
                .lock()
                .get(&mailbox_id)
                .unwrap_or_else(|| unreachable!("subscriber inserted above")),
        ))
    }

    /// The subscriber registry for a mailbox, if one already exists.
    #[must_use]
    pub fn existing_subscriber(&self, mailbox_id: MailboxId) -> Option<Arc<Subscriber>> {
        self.subscribers.lock().get(&mailbox_id).cloned()
    }

    /// Drops a mailbox's subscriber registry.
    ///
    /// Detaches the shard's shared channel listener when this was the last
    /// subscriber in the shard.
    pub fn drop_subscriber(&self, mailbox_id: MailboxId) {
        if self.subscribers.lock().remove(&mailbox_id).is_none() {
            return;
        }
        let index = self.channel_index(mailbox_id);
        let mut channels = self.channels.lock();
        let Some(attachment) = channels.get_mut(&index) else {
            return;
        };
        attachment.mailboxes -= 1;
        if attachment.mailboxes == 0 {
            let attachment = channels
                .remove(&index)
                .unwrap_or_else(|| unreachable!("attachment fetched above"));
            drop(channels);
            if let Some(backend) = &self.backend {
                if let Err(e) = backend.unsubscribe(attachment.subscription) {
                    error!("failed to detach channel {index}: {e}");
                }
            }
        }
    }

    fn attach_channel(&self, mailbox_id: MailboxId) -> CoreResult<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let index = self.channel_index(mailbox_id);
        let mut channels = self.channels.lock();
        if let Some(attachment) = channels.get_mut(&index) {
            attachment.mailboxes += 1;
            return Ok(());
        }
        let weak = self.weak_self.clone();
        let subscription = backend.subscribe(
            &self.topic(index),
            Arc::new(move |payload| {
                if let Some(hub) = weak.upgrade() {
                    hub.on_message(payload);
                }
            }),
        )?;
        channels.insert(
            index,
            ChannelAttachment {
                subscription,
                mailboxes: 1,
            },
        );
        Ok(())
    }

    /// Handles one payload arriving from a shared channel.
    fn on_message(&self, payload: &[u8]) {
        let notification = match ChangeNotification::decode(payload) {
            Ok(notification) => notification,
            Err(e) => {
                error!("dropping undecodable cluster notification: {e}");
                return;
            }
        };
        // The originating instance already delivered synchronously at
        // publish time.
        if notification.origin_hash == self.origin_hash(notification.mailbox_id) {
            return;
        }
        let subscriber = self
            .subscribers
            .lock()
            .get(&notification.mailbox_id)
            .cloned();
        if let Some(subscriber) = subscriber {
            // The originating session may be connected here too; it already
            // observed its own change.
            subscriber.notify_all(&notification, notification.source);
        }
    }

    /// Builds a publisher for a mailbox.
    ///
    /// The publisher shares the mailbox's subscriber registry; in cluster
    /// mode it also carries the shard channel for remote fan-out.
    pub fn publisher(&self, mailbox_id: MailboxId) -> CoreResult<Publisher> {
        let subscriber = self.subscriber(mailbox_id)?;
        let remote = self.backend.as_ref().map(|backend| RemoteChannel {
            backend: Arc::clone(backend),
            topic: self.topic(self.channel_index(mailbox_id)),
        });
        Ok(Publisher {
            mailbox_id,
            subscriber,
            origin_hash: self.origin_hash(mailbox_id),
            remote,
        })
    }

    /// Number of listeners registered for a mailbox in this process.
    #[must_use]
    pub fn num_listeners(&self, mailbox_id: MailboxId) -> usize {
        self.subscribers
            .lock()
            .get(&mailbox_id)
            .map_or(0, |s| s.num_listeners())
    }

    /// Number of shard channels this process is attached to.
    #[must_use]
    pub fn attached_channels(&self) -> usize {
        self.channels.lock().len()
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("clustered", &self.backend.is_some())
            .field("channel_count", &self.channel_count)
            .field("subscribers", &self.subscribers.lock().len())
            .field("attached_channels", &self.attached_channels())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailstate_backend::MemoryBackend;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Recording {
        id: SessionId,
        kind: ListenerKind,
        seen: Mutex<Vec<u64>>,
        disconnected: AtomicBool,
    }

    impl Recording {
        fn new(kind: ListenerKind) -> Arc<Self> {
            Arc::new(Self {
                id: SessionId::new(),
                kind,
                seen: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            })
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().clone()
        }
    }

    impl SessionListener for Recording {
        fn session_id(&self) -> SessionId {
            self.id
        }
        fn kind(&self) -> ListenerKind {
            self.kind
        }
        fn notify(&self, notification: &ChangeNotification) {
            self.seen.lock().push(notification.change_id);
        }
        fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    fn change(item: u64) -> ItemChange {
        ItemChange {
            item_id: crate::types::ItemId::new(item),
            kind: ChangeKind::Modified,
            reason: 1,
        }
    }

    const MBOX: MailboxId = MailboxId::new(7);

    #[test]
    fn local_hub_notifies_even_empty_change_sets() {
        let hub = NotificationHub::local(4);
        let listener = Recording::new(ListenerKind::Interactive);
        hub.subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&listener) as Arc<dyn SessionListener>);

        let publisher = hub.publisher(MBOX).unwrap();
        publisher.publish(Vec::new(), 1, None).unwrap();
        publisher.publish(vec![change(10)], 2, None).unwrap();

        assert_eq!(listener.seen(), vec![1, 2]);
        assert_eq!(publisher.num_listeners(), 1);
        assert_eq!(hub.attached_channels(), 0);
    }

    #[test]
    fn congruent_mailboxes_share_a_channel() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );

        assert_eq!(hub.channel_index(MailboxId::new(7)), 3);
        assert_eq!(hub.channel_index(MailboxId::new(11)), 3);

        hub.subscriber(MailboxId::new(7)).unwrap();
        hub.subscriber(MailboxId::new(11)).unwrap();
        assert_eq!(hub.attached_channels(), 1);
        assert_eq!(backend.subscription_count(), 1);

        hub.subscriber(MailboxId::new(4)).unwrap();
        assert_eq!(hub.attached_channels(), 2);
    }

    #[test]
    fn last_subscriber_detaches_the_channel() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );
        hub.subscriber(MailboxId::new(3)).unwrap();
        hub.subscriber(MailboxId::new(7)).unwrap();
        assert_eq!(backend.subscription_count(), 1);

        hub.drop_subscriber(MailboxId::new(3));
        assert_eq!(backend.subscription_count(), 1);
        hub.drop_subscriber(MailboxId::new(7));
        assert_eq!(backend.subscription_count(), 0);
        assert_eq!(hub.attached_channels(), 0);
    }

    #[test]
    fn cross_node_delivery_with_loop_prevention() {
        let backend = Arc::new(MemoryBackend::new());
        let node_a = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );
        let node_b = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );

        let on_a = Recording::new(ListenerKind::Interactive);
        node_a
            .subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&on_a) as Arc<dyn SessionListener>);
        let on_b = Recording::new(ListenerKind::Interactive);
        node_b
            .subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&on_b) as Arc<dyn SessionListener>);

        node_a
            .publisher(MBOX)
            .unwrap()
            .publish(vec![change(10)], 5, None)
            .unwrap();

        // Local listener saw it exactly once (synchronous delivery; the
        // channel echo was suppressed), remote listener exactly once.
        assert_eq!(on_a.seen(), vec![5]);
        assert_eq!(on_b.seen(), vec![5]);
    }

    #[test]
    fn originating_session_is_not_redelivered_remotely() {
        let backend = Arc::new(MemoryBackend::new());
        let node_a = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );
        let node_b = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );

        // The same logical session is connected on both nodes.
        let roaming = Recording::new(ListenerKind::Interactive);
        let twin = Arc::new(Recording {
            id: roaming.id,
            kind: ListenerKind::Interactive,
            seen: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        });
        let other = Recording::new(ListenerKind::Interactive);
        node_a
            .subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&roaming) as Arc<dyn SessionListener>);
        node_b
            .subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&twin) as Arc<dyn SessionListener>);
        node_b
            .subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&other) as Arc<dyn SessionListener>);

        node_a
            .publisher(MBOX)
            .unwrap()
            .publish(vec![change(10)], 9, Some(roaming.id))
            .unwrap();

        assert_eq!(roaming.seen(), vec![9]);
        assert_eq!(twin.seen(), Vec::<u64>::new());
        assert_eq!(other.seen(), vec![9]);
    }

    #[test]
    fn empty_change_set_never_reaches_the_cluster() {
        let backend = Arc::new(MemoryBackend::new());
        let node_a = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );
        let node_b = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );

        let local = Recording::new(ListenerKind::Interactive);
        node_a
            .subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&local) as Arc<dyn SessionListener>);
        let remote = Recording::new(ListenerKind::Interactive);
        node_b
            .subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&remote) as Arc<dyn SessionListener>);

        node_a
            .publisher(MBOX)
            .unwrap()
            .publish(Vec::new(), 3, None)
            .unwrap();

        assert_eq!(local.seen(), vec![3]);
        assert_eq!(remote.seen(), Vec::<u64>::new());
    }

    #[test]
    fn malformed_channel_payload_is_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = NotificationHub::clustered(
            Arc::clone(&backend) as Arc<dyn SharedStateBackend>,
            4,
        );
        let listener = Recording::new(ListenerKind::Interactive);
        hub.subscriber(MBOX)
            .unwrap()
            .add_listener(Arc::clone(&listener) as Arc<dyn SessionListener>);

        backend.publish("notify:3", b"\xff garbage").unwrap();

        assert_eq!(listener.seen(), Vec::<u64>::new());
    }

    #[test]
    fn purge_disconnects_listeners() {
        let hub = NotificationHub::local(4);
        let subscriber = hub.subscriber(MBOX).unwrap();
        let listener = Recording::new(ListenerKind::Waiting);
        subscriber.add_listener(Arc::clone(&listener) as Arc<dyn SessionListener>);

        subscriber.purge_listeners();

        assert!(listener.disconnected.load(Ordering::SeqCst));
        assert_eq!(subscriber.num_listeners(), 0);
    }

    #[test]
    fn listeners_filter_by_kind() {
        let hub = NotificationHub::local(4);
        let subscriber = hub.subscriber(MBOX).unwrap();
        subscriber.add_listener(Recording::new(ListenerKind::Interactive));
        subscriber.add_listener(Recording::new(ListenerKind::Waiting));
        subscriber.add_listener(Recording::new(ListenerKind::Waiting));

        assert_eq!(subscriber.listeners_of_kind(ListenerKind::Waiting).len(), 2);
        assert_eq!(subscriber.listeners_of_kind(ListenerKind::System).len(), 0);
    }

    #[test]
    fn remove_listener_by_session_id() {
        let hub = NotificationHub::local(4);
        let subscriber = hub.subscriber(MBOX).unwrap();
        let listener = Recording::new(ListenerKind::Interactive);
        subscriber.add_listener(Arc::clone(&listener) as Arc<dyn SessionListener>);

        assert!(subscriber.remove_listener(listener.id));
        assert!(!subscriber.remove_listener(listener.id));
        assert_eq!(subscriber.num_listeners(), 0);
    }
}
