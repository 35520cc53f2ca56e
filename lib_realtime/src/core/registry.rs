//! # Observer Registry
//!
//! Handler lists shared by the connection manager and the distribution
//! service. Every registration returns a [`Subscription`] handle; dropping the
//! handle or calling [`Subscription::unsubscribe`] removes the handler.
//!
//! Handlers are invoked outside the list lock from a snapshot, so a handler
//! may subscribe, unsubscribe or read state without deadlocking. Each
//! snapshot entry re-checks its `active` flag right before the call, which is
//! what guarantees "no invocation after disposal" for calls that had not yet
//! started.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::message::{Message, WILDCARD_TOPIC};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a handler, catching any panic so siblings and the caller keep running.
///
/// Returns `false` if the handler panicked.
pub(crate) fn invoke_isolated<F: FnOnce()>(context: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("Handler fault in {}: {}", context, reason);
            false
        }
    }
}

type Remover = Box<dyn FnOnce() + Send>;

/// Handle to a registered callback.
///
/// Unsubscribing is idempotent and safe from any thread, including from
/// inside the callback itself. An invocation already running when the handle
/// is disposed is allowed to finish.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    remover: Mutex<Option<Remover>>,
}

impl Subscription {
    fn new(id: u64, active: Arc<AtomicBool>, remover: Remover) -> Self {
        Self {
            id,
            active,
            remover: Mutex::new(Some(remover)),
        }
    }

    /// Process-unique id of this registration.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stops further callbacks and removes the handler from its list.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
        let remover = lock(&self.remover).take();
        if let Some(remove) = remover {
            remove();
        }
    }

    /// Keeps the handler registered for the lifetime of its list.
    pub fn detach(self) {
        lock(&self.remover).take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Detached handles have no remover left and stay active.
        let remover = lock(&self.remover).take();
        if let Some(remove) = remover {
            self.active.store(false, Ordering::Release);
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Entry<T: ?Sized> {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Arc<T>,
}

/// A handler captured for one round of notifications.
pub(crate) struct Snapshot<T: ?Sized> {
    active: Arc<AtomicBool>,
    handler: Arc<T>,
}

impl<T: ?Sized> Snapshot<T> {
    /// The handler, if its subscription has not been disposed meanwhile.
    pub(crate) fn live(&self) -> Option<&T> {
        self.active
            .load(Ordering::Acquire)
            .then_some(self.handler.as_ref())
    }
}

/// An ordered list of handlers of one kind.
pub(crate) struct ObserverList<T: ?Sized> {
    entries: Arc<Mutex<Vec<Entry<T>>>>,
}

impl<T: ?Sized + Send + Sync + 'static> ObserverList<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn add(&self, handler: Arc<T>) -> Subscription {
        self.add_with_cleanup(handler, || {})
    }

    /// Like [`add`](Self::add); `on_empty` runs once removing this handler
    /// leaves the list empty. It is called without the list lock held.
    pub(crate) fn add_with_cleanup<C>(&self, handler: Arc<T>, on_empty: C) -> Subscription
    where
        C: FnOnce() + Send + 'static,
    {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        lock(&self.entries).push(Entry {
            id,
            active: Arc::clone(&active),
            handler,
        });

        let entries = Arc::downgrade(&self.entries);
        Subscription::new(
            id,
            active,
            Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    let empty = {
                        let mut entries = lock(&entries);
                        entries.retain(|e| e.id != id);
                        entries.is_empty()
                    };
                    if empty {
                        on_empty();
                    }
                }
            }),
        )
    }

    pub(crate) fn snapshot(&self) -> Vec<Snapshot<T>> {
        lock(&self.entries)
            .iter()
            .map(|e| Snapshot {
                active: Arc::clone(&e.active),
                handler: Arc::clone(&e.handler),
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Removes the list under `key` if it has no handlers left.
///
/// Callers add handlers while holding the map lock, so a list cannot gain a
/// handler between this check and its removal.
pub(crate) fn prune_empty<T: ?Sized + Send + Sync + 'static>(
    lists: &mut HashMap<String, Arc<ObserverList<T>>>,
    key: &str,
) {
    if lists.get(key).is_some_and(|l| l.len() == 0) {
        lists.remove(key);
    }
}

/// Callback type for topic subscribers.
pub type MessageHandler = dyn Fn(&Message) + Send + Sync;

/// Topic-keyed handler lists with `*` wildcard support.
pub(crate) struct TopicRegistry {
    topics: Arc<Mutex<HashMap<String, Arc<ObserverList<MessageHandler>>>>>,
}

impl TopicRegistry {
    pub(crate) fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The topic entry is dropped again when its last handler goes away.
    pub(crate) fn subscribe(&self, topic: &str, handler: Arc<MessageHandler>) -> Subscription {
        let mut topics = lock(&self.topics);
        let list = topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(ObserverList::new()));

        let registry = Arc::downgrade(&self.topics);
        let key = topic.to_string();
        list.add_with_cleanup(handler, move || {
            if let Some(topics) = registry.upgrade() {
                prune_empty(&mut lock(&topics), &key);
            }
        })
    }

    /// Invokes exact-topic handlers, then wildcard handlers.
    ///
    /// Returns `(delivered, faults)`.
    pub(crate) fn dispatch(&self, message: &Message) -> (usize, usize) {
        let handlers: Vec<Snapshot<MessageHandler>> = {
            let topics = lock(&self.topics);
            let exact = topics.get(message.topic.as_str()).map(|l| l.snapshot());
            let wildcard = if message.topic == WILDCARD_TOPIC {
                None
            } else {
                topics.get(WILDCARD_TOPIC).map(|l| l.snapshot())
            };
            exact
                .into_iter()
                .flatten()
                .chain(wildcard.into_iter().flatten())
                .collect()
        };

        let mut delivered = 0;
        let mut faults = 0;
        for snapshot in &handlers {
            if let Some(handler) = snapshot.live() {
                delivered += 1;
                if !invoke_isolated(&message.topic, || handler(message)) {
                    faults += 1;
                }
            }
        }
        (delivered, faults)
    }

    /// Number of topics with at least one handler.
    pub(crate) fn topic_count(&self) -> usize {
        lock(&self.topics).values().filter(|l| l.len() > 0).count()
    }

    pub(crate) fn handler_count(&self) -> usize {
        lock(&self.topics).values().map(|l| l.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Payload;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    fn message(topic: &str) -> Message {
        Message {
            topic: topic.to_string(),
            timestamp: "t".to_string(),
            payload: Payload::Opaque(Value::Null),
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<MessageHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handler: Arc<MessageHandler> = Arc::new(move |_: &Message| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn test_exact_and_wildcard_handlers_receive_message() {
        let registry = TopicRegistry::new();
        let (exact, h1) = counter();
        let (wild, h2) = counter();
        let (other, h3) = counter();
        let _s1 = registry.subscribe("a", h1);
        let _s2 = registry.subscribe("*", h2);
        let _s3 = registry.subscribe("b", h3);

        assert_eq!(registry.dispatch(&message("a")), (2, 0));
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wild.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
        assert_eq!(registry.topic_count(), 3);
        assert_eq!(registry.handler_count(), 3);
    }

    #[test]
    fn test_exact_handlers_run_before_wildcard() {
        let registry = TopicRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (Arc::clone(&order), Arc::clone(&order));
        let _w = registry.subscribe("*", Arc::new(move |_: &Message| lock(&o1).push("wild")));
        let _e = registry.subscribe("a", Arc::new(move |_: &Message| lock(&o2).push("exact")));
        registry.dispatch(&message("a"));
        assert_eq!(*lock(&order), vec!["exact", "wild"]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let registry = TopicRegistry::new();
        let (count, ok) = counter();
        let _bad = registry.subscribe("a", Arc::new(|_: &Message| panic!("boom")));
        let _good = registry.subscribe("a", ok);
        assert_eq!(registry.dispatch(&message("a")), (2, 1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_stops_delivery() {
        let registry = TopicRegistry::new();
        let (count, h) = counter();
        let sub = registry.subscribe("a", h);
        registry.dispatch(&message("a"));
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        registry.dispatch(&message("a"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_count(), 0);
    }

    #[test]
    fn test_topic_entry_is_pruned_with_its_last_handler() {
        let registry = TopicRegistry::new();
        let (_, h1) = counter();
        let (_, h2) = counter();
        let first = registry.subscribe("line-1", h1);
        let second = registry.subscribe("line-1", h2);

        first.unsubscribe();
        assert_eq!(lock(&registry.topics).len(), 1);
        drop(second);
        assert!(lock(&registry.topics).is_empty());

        // A fresh subscription to the same topic still receives messages.
        let (count, h3) = counter();
        let _third = registry.subscribe("line-1", h3);
        registry.dispatch(&message("line-1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(lock(&registry.topics).len(), 1);
    }

    #[test]
    fn test_drop_unsubscribes_but_detach_keeps_handler() {
        let registry = TopicRegistry::new();
        let (dropped, h1) = counter();
        let (kept, h2) = counter();
        drop(registry.subscribe("a", h1));
        registry.subscribe("a", h2).detach();
        registry.dispatch(&message("a"));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        assert_eq!(kept.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let registry = Arc::new(TopicRegistry::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let (s, c) = (Arc::clone(&slot), Arc::clone(&count));
        let sub = registry.subscribe(
            "a",
            Arc::new(move |_: &Message| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = lock(&s).take() {
                    sub.unsubscribe();
                }
            }),
        );
        *lock(&slot) = Some(sub);
        registry.dispatch(&message("a"));
        registry.dispatch(&message("a"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
