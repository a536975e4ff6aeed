//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read with [`Signal::get`] inside a collecting run, it
//!    publishes itself (at rank 0) to the [`Tracker`].
//!
//! 2. The run subscribes to it once it finishes.
//!
//! 3. [`Signal::set`] stores the value and notifies the observers inside a
//!    batch, so dependents re-run in rank order when the batch closes.
//!
//! # Memory Layout
//!
//! Every cell (signals, computed values, lazy variants) shares [`CellInner`]:
//! an ID, the value slot, a rank shared with the producing effect (if any),
//! the observer set, and an optional hook fired when the last observer
//! leaves.

use std::fmt::{self, Debug};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::subscriber::{Notify, Observers, Source, Subscriber, SubscriberId};
use super::tracker::Tracker;
use crate::graph::{Batcher, NodeId, NodeKind, Rank, RankCell};

/// The value slot of a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellState<T> {
    /// Nothing has been produced yet, or the cell was reset.
    Uninitialized,
    Value(T),
}

impl<T> CellState<T> {
    pub fn is_initialized(&self) -> bool {
        matches!(self, CellState::Value(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            CellState::Value(value) => Some(value),
            CellState::Uninitialized => None,
        }
    }
}

type UnobservedHook = Box<dyn Fn() + Send + Sync>;

/// Storage shared by every kind of cell.
pub(crate) struct CellInner<T> {
    id: NodeId,
    kind: NodeKind,
    state: RwLock<CellState<T>>,
    rank: Arc<RankCell>,
    observers: Observers,
    on_unobserved: OnceLock<UnobservedHook>,
}

impl<T> CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(kind: NodeKind, state: CellState<T>, rank: Arc<RankCell>) -> Arc<Self> {
        Arc::new(Self {
            id: NodeId::new(),
            kind,
            state: RwLock::new(state),
            rank,
            observers: Observers::new(),
            on_unobserved: OnceLock::new(),
        })
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Install the hook fired when the observer count drops to zero.
    pub(crate) fn set_unobserved_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        let _ = self.on_unobserved.set(Box::new(hook));
    }

    /// Publish this cell to the running collector, if any.
    pub(crate) fn track(self: &Arc<Self>) {
        if Tracker::is_collecting() {
            Tracker::publish(self.rank.get(), self.clone());
        }
    }

    /// Like [`track`](CellInner::track), but the published source also owns
    /// `anchor`, so whoever subscribes keeps it alive.
    pub(crate) fn track_with<A>(self: &Arc<Self>, anchor: impl FnOnce() -> A)
    where
        A: Send + Sync + 'static,
    {
        if Tracker::is_collecting() {
            let source = Anchored {
                cell: self.clone(),
                _anchor: anchor(),
            };
            Tracker::publish(self.rank.get(), Arc::new(source));
        }
    }

    pub(crate) fn value(&self) -> Option<T> {
        self.state.read().as_option().cloned()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let state = self.state.read_recursive();
        f(state.as_option())
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state.read().is_initialized()
    }

    /// Return the value, producing it with `init` if the cell is empty.
    ///
    /// `init` runs without holding the lock, so it may read other cells.
    pub(crate) fn get_or_init(&self, init: impl FnOnce() -> T) -> T {
        if let Some(value) = self.value() {
            return value;
        }
        let fresh = init();
        let mut state = self.state.write();
        match &*state {
            CellState::Value(existing) => existing.clone(),
            CellState::Uninitialized => {
                *state = CellState::Value(fresh.clone());
                fresh
            }
        }
    }

    /// Store a value and notify observers inside a batch.
    pub(crate) fn write(&self, value: T) {
        Batcher::run(|| {
            *self.state.write() = CellState::Value(value);
            self.observers.notify_all();
        });
    }

    /// Drop the value without notifying anyone.
    pub(crate) fn reset(&self) {
        *self.state.write() = CellState::Uninitialized;
    }
}

impl<T> Source for CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn rank(&self) -> Rank {
        self.rank.get()
    }

    fn observe(&self, notify: Notify) -> SubscriberId {
        self.observers.insert(Subscriber::new(notify))
    }

    fn unobserve(&self, id: SubscriberId) {
        if self.observers.remove(id) == 0 {
            if let Some(hook) = self.on_unobserved.get() {
                hook();
            }
        }
    }

    fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

/// A cell as seen by its dependents, bundled with what produces it.
struct Anchored<T, A> {
    cell: Arc<CellInner<T>>,
    _anchor: A,
}

impl<T, A> Source for Anchored<T, A>
where
    T: Clone + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.cell.id
    }

    fn rank(&self) -> Rank {
        self.cell.rank.get()
    }

    fn observe(&self, notify: Notify) -> SubscriberId {
        self.cell.observe(notify)
    }

    fn unobserve(&self, id: SubscriberId) {
        self.cell.unobserve(id)
    }

    fn observer_count(&self) -> usize {
        self.cell.observer_count()
    }
}

/// A reactive signal holding a value of type T.
///
/// # Type Parameters
///
/// - `T`: The type of value stored in the signal. Must be Clone + Send + Sync.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::Signal;
///
/// let count = Signal::new(0);
///
/// // Read the value
/// assert_eq!(count.get(), 0);
///
/// // Update the value (notifies subscribers)
/// count.set(5);
/// assert_eq!(count.peek(), 5);
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            inner: CellInner::new(
                NodeKind::Source,
                CellState::Value(value),
                Arc::new(RankCell::new(Rank::SOURCE)),
            ),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id()
    }

    /// Get the current value.
    ///
    /// If called within a collecting run, this also registers the signal as a
    /// dependency of that run.
    pub fn get(&self) -> T {
        self.inner.track();
        self.peek()
    }

    /// Get the current value without tracking dependencies.
    pub fn peek(&self) -> T {
        self.inner.with(|value| value.cloned()).expect("signals are always initialized")
    }

    /// Borrow the current value (tracked).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.track();
        self.inner.with(|value| f(value.expect("signals are always initialized")))
    }

    /// Set a new value and notify subscribers.
    ///
    /// Dependents re-run when the outermost batch closes.
    pub fn set(&self, value: T) {
        self.inner.write(value);
    }

    /// Update the value using a function.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.peek());
        self.set(next);
    }

    /// Get the number of observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observer_count()
    }

    pub(crate) fn source(&self) -> Arc<dyn Source> {
        self.inner.clone()
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id())
            .field("value", &self.peek())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
