//! Reference-counted reactive cache.
//!
//! A [`CacheEntry`] wraps a state [`Signal`] with a reference count, a lock
//! count and an eviction policy. [`QueriesCache`] maps keys to entries and
//! forgets an entry once it is evicted.
//!
//! # Lifecycle
//!
//! 1. [`QueriesCache::acquire`] returns a [`CacheRef`], creating the entry
//!    on first use.
//! 2. Every live [`CacheRef`] and [`EntryLock`] keeps the entry alive.
//! 3. When the last one is dropped the entry's [`CacheLifetime`] decides:
//!    `Immediate` evicts now, `Forever` keeps it, `After(d)` starts a timer on
//!    the ambient tokio runtime that a new reference cancels.
//! 4. Eviction runs the entry's listeners exactly once and cancels its
//!    in-flight request.

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::indirect_map::IndirectMap;
use crate::config::CacheLifetime;
use crate::debug::{DebugChannel, DebugSink};
use crate::graph::{Batcher, NodeId};
use crate::reactive::Signal;

type Listener = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct EntryInner {
    refs: usize,
    locks: usize,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    evicted: bool,
    listeners: Vec<Listener>,
    request: Option<(u64, CancellationToken)>,
    next_request: u64,
}

impl EntryInner {
    fn is_unreferenced(&self) -> bool {
        self.refs == 0 && self.locks == 0
    }

    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// One cached state cell.
pub struct CacheEntry<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    id: NodeId,
    label: String,
    state: Signal<S>,
    lifetime: CacheLifetime,
    inner: Mutex<EntryInner>,
    writer: ReentrantMutex<()>,
    changed: Notify,
    debug: Option<DebugChannel>,
}

impl<S> CacheEntry<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    /// An entry not owned by any [`QueriesCache`].
    pub fn detached(
        label: impl Into<String>,
        initial: S,
        lifetime: CacheLifetime,
        sink: Option<&Arc<dyn DebugSink>>,
    ) -> Arc<Self> {
        let label = label.into();
        let state = Signal::new(initial);

        let debug = sink.map(|sink| {
            let state = state.clone();
            DebugChannel::open(sink.as_ref(), &label, move || serde_json::to_value(state.peek()).ok())
        });

        tracing::debug!(entry = %label, ?lifetime, "cache entry created");

        Arc::new(Self {
            id: NodeId::new(),
            label,
            state,
            lifetime,
            inner: Mutex::new(EntryInner::default()),
            writer: ReentrantMutex::new(()),
            changed: Notify::new(),
            debug,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// `"{cache name}:{serial}:{serialized key}"` for cached entries.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn lifetime(&self) -> CacheLifetime {
        self.lifetime
    }

    /// Tracked read of the current state.
    pub fn state(&self) -> S {
        self.state.get()
    }

    pub fn peek(&self) -> S {
        self.state.peek()
    }

    pub fn signal(&self) -> &Signal<S> {
        &self.state
    }

    /// Replace the state, notify dependents, and wake async waiters.
    pub fn set(&self, state: S) {
        Batcher::run(|| {
            let _writer = self.writer.lock();
            self.store(state);
        });
        self.changed.notify_waiters();
    }

    pub fn update(&self, f: impl FnOnce(&S) -> S) {
        let _ = self.try_update(|state| {
            let next = f(state);
            *state = next;
            Ok::<_, Infallible>(Some(()))
        });
    }

    /// Read-modify-write of the state.
    ///
    /// Writers to the same entry are serialized, so concurrent updates are
    /// never lost. `f` works on a copy: returning `Ok(None)` or an error
    /// leaves the entry untouched. Dependents run once the writer lock is
    /// released.
    pub fn try_update<R, E>(&self, f: impl FnOnce(&mut S) -> Result<Option<R>, E>) -> Result<Option<R>, E> {
        let outcome = Batcher::run(|| {
            let _writer = self.writer.lock();
            let mut state = self.peek();
            let outcome = f(&mut state);
            if let Ok(Some(_)) = &outcome {
                self.store(state);
            }
            outcome
        });
        if let Ok(Some(_)) = &outcome {
            self.changed.notify_waiters();
        }
        outcome
    }

    fn store(&self, state: S) {
        self.state.set(state);
        if let Some(debug) = &self.debug {
            debug.schedule();
        }
    }

    /// Resolves on the next [`set`](CacheEntry::set) after it was enabled.
    pub fn changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.changed.notified()
    }

    pub fn ref_count(&self) -> usize {
        self.inner.lock().refs
    }

    pub fn lock_count(&self) -> usize {
        self.inner.lock().locks
    }

    pub fn is_evicted(&self) -> bool {
        self.inner.lock().evicted
    }

    /// Take a reference, cancelling any pending eviction.
    pub fn retain(self: &Arc<Self>) -> CacheRef<S> {
        let mut inner = self.inner.lock();
        inner.refs += 1;
        inner.cancel_timer();
        drop(inner);

        CacheRef {
            entry: Arc::clone(self),
        }
    }

    /// Prevent eviction until the guard is dropped. Locks count as
    /// references.
    pub fn lock(self: &Arc<Self>) -> EntryLock<S> {
        let mut inner = self.inner.lock();
        inner.locks += 1;
        inner.cancel_timer();
        drop(inner);

        EntryLock {
            entry: Arc::clone(self),
        }
    }

    fn release(self: &Arc<Self>, lock: bool) {
        let mut inner = self.inner.lock();
        if lock {
            inner.locks = inner.locks.saturating_sub(1);
        } else {
            inner.refs = inner.refs.saturating_sub(1);
        }
        if !inner.is_unreferenced() || inner.evicted {
            return;
        }
        drop(inner);

        match self.lifetime {
            CacheLifetime::Immediate => self.evict(),
            CacheLifetime::Forever => {}
            CacheLifetime::After(delay) => self.schedule_eviction(delay),
        }
    }

    fn schedule_eviction(self: &Arc<Self>, delay: std::time::Duration) {
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(entry = %self.label, ?delay, "no tokio runtime for the eviction timer, keeping entry");
            return;
        };

        let mut inner = self.inner.lock();
        inner.cancel_timer();
        let generation = inner.generation;
        let entry = Arc::downgrade(self);
        inner.timer = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(entry) = entry.upgrade() {
                entry.expire(generation);
            }
        }));
    }

    fn expire(&self, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || !inner.is_unreferenced() {
                return;
            }
            inner.timer = None;
        }
        self.evict();
    }

    /// Remove the entry for good. Listeners run once, outside the lock.
    pub fn evict(&self) {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.evicted {
                return;
            }
            inner.evicted = true;
            inner.cancel_timer();
            if let Some((_, token)) = inner.request.take() {
                token.cancel();
            }
            std::mem::take(&mut inner.listeners)
        };

        tracing::debug!(entry = %self.label, listeners = listeners.len(), "cache entry evicted");
        for listener in listeners {
            listener();
        }
        self.changed.notify_waiters();
    }

    /// Run `listener` on eviction, or now if already evicted.
    pub fn on_evict(&self, listener: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.evicted {
            drop(inner);
            listener();
            return;
        }
        inner.listeners.push(Box::new(listener));
    }

    /// Start a new request, cancelling the one in flight.
    pub fn begin_request(&self) -> (u64, CancellationToken) {
        let mut inner = self.inner.lock();
        inner.next_request += 1;
        let id = inner.next_request;
        let token = CancellationToken::new();
        if let Some((previous, stale)) = inner.request.replace((id, token.clone())) {
            tracing::debug!(entry = %self.label, request = previous, "cancelling superseded request");
            stale.cancel();
        }
        (id, token)
    }

    pub fn is_current_request(&self, id: u64) -> bool {
        matches!(self.inner.lock().request, Some((current, _)) if current == id)
    }

    /// Clear request `id` if it is still the current one.
    pub fn finish_request(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.request, Some((current, _)) if current == id) {
            inner.request = None;
            true
        } else {
            false
        }
    }
}

impl<S> fmt::Debug for CacheEntry<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CacheEntry")
            .field("label", &self.label)
            .field("refs", &inner.refs)
            .field("locks", &inner.locks)
            .field("evicted", &inner.evicted)
            .finish()
    }
}

/// A counted reference to a [`CacheEntry`].
pub struct CacheRef<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    entry: Arc<CacheEntry<S>>,
}

impl<S> CacheRef<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    pub fn entry(&self) -> &Arc<CacheEntry<S>> {
        &self.entry
    }
}

impl<S> std::ops::Deref for CacheRef<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    type Target = Arc<CacheEntry<S>>;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl<S> Clone for CacheRef<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    fn clone(&self) -> Self {
        self.entry.retain()
    }
}

impl<S> Drop for CacheRef<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    fn drop(&mut self) {
        self.entry.release(false);
    }
}

impl<S> fmt::Debug for CacheRef<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheRef").field(&self.entry).finish()
    }
}

/// Keeps a [`CacheEntry`] from being evicted while alive.
pub struct EntryLock<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    entry: Arc<CacheEntry<S>>,
}

impl<S> EntryLock<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    pub fn entry(&self) -> &Arc<CacheEntry<S>> {
        &self.entry
    }
}

impl<S> Drop for EntryLock<S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    fn drop(&mut self) {
        self.entry.release(true);
    }
}

struct CacheShared<K, S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    name: String,
    lifetime: CacheLifetime,
    debug_sink: Option<Arc<dyn DebugSink>>,
    entries: Mutex<IndirectMap<K, Arc<CacheEntry<S>>>>,
    serial: AtomicU64,
}

/// Keyed collection of [`CacheEntry`]s sharing one lifetime.
pub struct QueriesCache<K, S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    shared: Arc<CacheShared<K, S>>,
}

impl<K, S> QueriesCache<K, S>
where
    K: Serialize + PartialEq + Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + Serialize + 'static,
{
    pub fn new(
        name: impl Into<String>,
        lifetime: CacheLifetime,
        debug_sink: Option<Arc<dyn DebugSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                name: name.into(),
                lifetime,
                debug_sink,
                entries: Mutex::new(IndirectMap::new()),
                serial: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn lifetime(&self) -> CacheLifetime {
        self.shared.lifetime
    }

    /// Reference the entry for `key`, creating it from `init` if missing.
    ///
    /// The flag is `true` when the entry was created by this call.
    pub fn acquire(&self, key: &K, init: impl FnOnce(&K) -> S) -> (CacheRef<S>, bool) {
        if let Some(entry) = self.get(key) {
            return (entry.retain(), false);
        }

        let serial = self.shared.serial.fetch_add(1, Ordering::Relaxed);
        let args = serde_json::to_string(key).unwrap_or_else(|_| "?".into());
        let label = format!("{}:{}:{}", self.shared.name, serial, args);
        let entry = CacheEntry::detached(label, init(key), self.shared.lifetime, self.shared.debug_sink.as_ref());

        {
            let mut entries = self.shared.entries.lock();
            if let Some(existing) = entries.get(key) {
                if !existing.is_evicted() {
                    let existing = existing.clone();
                    drop(entries);
                    return (existing.retain(), false);
                }
            }
            entries.insert(key.clone(), entry.clone());
        }

        let shared: Weak<CacheShared<K, S>> = Arc::downgrade(&self.shared);
        let id = entry.id();
        let key = key.clone();
        entry.on_evict(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let removed = {
                let mut entries = shared.entries.lock();
                if entries.get(&key).map(|e| e.id()) == Some(id) {
                    entries.remove(&key)
                } else {
                    None
                }
            };
            drop(removed);
        });

        (entry.retain(), true)
    }

    /// The live entry for `key`, without taking a reference.
    pub fn get(&self, key: &K) -> Option<Arc<CacheEntry<S>>> {
        let entries = self.shared.entries.lock();
        entries.get(key).filter(|e| !e.is_evicted()).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Evict the entry for `key`, whatever its reference count.
    pub fn remove(&self, key: &K) -> bool {
        let entry = self.shared.entries.lock().remove(key);
        match entry {
            Some(entry) => {
                entry.evict();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every entry.
    pub fn clear(&self) {
        let entries: Vec<_> = {
            let mut map = self.shared.entries.lock();
            let entries = map.values().cloned().collect();
            map.clear();
            entries
        };
        for entry in entries {
            entry.evict();
        }
    }
}

impl<K, S> Clone for QueriesCache<K, S>
where
    S: Clone + Send + Sync + Serialize + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, S> fmt::Debug for QueriesCache<K, S>
where
    K: Serialize + PartialEq,
    S: Clone + Send + Sync + Serialize + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueriesCache")
            .field("name", &self.shared.name)
            .field("lifetime", &self.shared.lifetime)
            .field("entries", &self.shared.entries.lock().len())
            .finish()
    }
}
