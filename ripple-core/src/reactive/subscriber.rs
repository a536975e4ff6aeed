//! Subscriber types for the reactive system.
//!
//! A cell notifies its observers whenever it is written. Observers are
//! registered through [`Source::observe`] and removed when the returned
//! [`Subscription`] guard is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::graph::{NodeId, Rank};

/// Unique identifier for a subscriber.
///
/// Each registration on a cell gets its own ID, so the same effect can be
/// removed from one cell without touching its registrations elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked when an observed cell changes.
pub type Notify = Arc<dyn Fn() + Send + Sync>;

/// Anything that can be read in a tracked context and observed afterwards.
pub trait Source: Send + Sync {
    /// Identity used to deduplicate reads within one run.
    fn node_id(&self) -> NodeId;

    /// Current topological rank.
    fn rank(&self) -> Rank;

    /// Register `notify` to run on every change.
    fn observe(&self, notify: Notify) -> SubscriberId;

    /// Remove a registration made by [`observe`](Source::observe).
    fn unobserve(&self, id: SubscriberId);

    /// Number of live registrations.
    fn observer_count(&self) -> usize;
}

/// A registered observer.
pub struct Subscriber {
    id: SubscriberId,
    notify: Notify,
}

impl Subscriber {
    /// Create a new subscriber with the given notification callback.
    pub fn new(notify: Notify) -> Self {
        Self {
            id: SubscriberId::new(),
            notify,
        }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Notify the subscriber that one of its dependencies changed.
    pub fn notify(&self) {
        (self.notify)();
    }
}

/// The observer set of one cell.
#[derive(Default)]
pub struct Observers {
    entries: Mutex<IndexMap<SubscriberId, Notify>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscriber: Subscriber) -> SubscriberId {
        let id = subscriber.id;
        self.entries.lock().insert(id, subscriber.notify);
        id
    }

    /// Remove an observer and return how many are left.
    pub fn remove(&self, id: SubscriberId) -> usize {
        let mut entries = self.entries.lock();
        entries.shift_remove(&id);
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every observer, in registration order.
    ///
    /// The set is snapshotted first so observers may subscribe or unsubscribe
    /// while being notified.
    pub fn notify_all(&self) {
        let snapshot: SmallVec<[Notify; 4]> = self.entries.lock().values().cloned().collect();
        for notify in snapshot {
            notify();
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("len", &self.len()).finish()
    }
}

/// RAII registration on a [`Source`]. Dropping it unobserves.
pub struct Subscription {
    source: Arc<dyn Source>,
    id: SubscriberId,
}

impl Subscription {
    pub fn new(source: Arc<dyn Source>, notify: Notify) -> Self {
        let id = source.observe(notify);
        Self { source, id }
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.source.unobserve(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("source", &self.source.node_id())
            .field("id", &self.id)
            .finish()
    }
}
