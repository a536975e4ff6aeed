//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately inside a
//!    collecting context to establish initial dependencies.
//!
//! 2. After the run, its rank becomes one above the deepest cell it read, it
//!    subscribes to cells read for the first time and drops the
//!    subscriptions of cells it no longer read.
//!
//! 3. When any dependency changes, the whole run is scheduled through the
//!    [`Batcher`] under the effect's current rank.
//!
//! # Differences from Computed
//!
//! - A [`Computed`](super::Computed) is an effect that writes its result into
//!   a cell; a plain effect produces nothing.
//! - A [`FastEffect`] is the same core without the automatic first run.
//!
//! # Failures
//!
//! The run function is infallible. If it panics, the panic unwinds to whoever
//! triggered the run. A run requested while this thread is already collecting
//! is skipped and logged, keeping the previous subscriptions. Rewiring only happens after a run returns, so the
//! previous subscriptions survive a panicking run.

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::subscriber::{Notify, Subscription};
use super::tracker::{Dependencies, Tracker};
use crate::error::Error;
use crate::graph::{Batcher, NodeId, Rank, RankCell};

#[derive(Default)]
struct EffectState {
    running: bool,
    disposed: bool,
    subscriptions: IndexMap<NodeId, Subscription>,
    run_count: usize,
}

/// The run routine and subscriptions shared by every effect flavour.
pub(crate) struct EffectCore {
    id: NodeId,
    run: Box<dyn Fn() + Send + Sync>,
    rank: Arc<RankCell>,
    state: Mutex<EffectState>,
    this: Weak<EffectCore>,
}

impl EffectCore {
    pub(crate) fn new<F>(run: F, rank: Arc<RankCell>) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new_cyclic(|this| Self {
            id: NodeId::new(),
            run: Box::new(run),
            rank,
            state: Mutex::new(EffectState::default()),
            this: this.clone(),
        })
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn rank(&self) -> Rank {
        self.rank.get()
    }

    pub(crate) fn run_count(&self) -> usize {
        self.state.lock().run_count
    }

    pub(crate) fn dependency_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Mark the effect running and execute it once.
    pub(crate) fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.running {
                return;
            }
            state.running = true;
        }
        Tracker::untracked(|| self.execute());
    }

    /// Drop every subscription. Queued runs become no-ops.
    pub(crate) fn stop(&self) {
        let stale = {
            let mut state = self.state.lock();
            state.running = false;
            std::mem::take(&mut state.subscriptions)
        };
        tracing::trace!(effect = %self.id, released = stale.len(), "effect stopped");
        drop(stale);
    }

    pub(crate) fn dispose(&self) {
        self.state.lock().disposed = true;
        self.stop();
    }

    /// One full run: collect, re-rank, rewire.
    pub(crate) fn execute(&self) {
        if !self.is_running() {
            return;
        }

        let ((), dependencies) = match Tracker::collect(|| (self.run)()) {
            Ok(collected) => collected,
            Err(err) => {
                // Callers vacate the slot first; a busy slot is a bug upstream.
                debug_assert!(!matches!(err, Error::CollectorBusy), "effect {} cannot run: {err}", self.id);
                tracing::error!(effect = %self.id, error = %err, "effect cannot run, skipping");
                return;
            }
        };

        self.rank.set(Rank::above(dependencies.iter().map(|d| d.rank)));
        let stale = self.rewire(dependencies);
        drop(stale);
    }

    /// Swap in the subscriptions of the last run. Returns the stale ones so
    /// the caller drops them outside the lock.
    fn rewire(&self, dependencies: Dependencies) -> IndexMap<NodeId, Subscription> {
        let mut state = self.state.lock();
        state.run_count += 1;

        let mut previous = std::mem::take(&mut state.subscriptions);
        if !state.running {
            // Stopped from inside its own run.
            return previous;
        }

        let mut created = 0usize;
        for dependency in dependencies {
            let id = dependency.node_id();
            let subscription = match previous.swap_remove(&id) {
                Some(kept) => kept,
                None => {
                    created += 1;
                    Subscription::new(dependency.source, self.notifier())
                }
            };
            state.subscriptions.insert(id, subscription);
        }

        tracing::trace!(
            effect = %self.id,
            rank = %self.rank.get(),
            created,
            dropped = previous.len(),
            "effect rewired"
        );
        previous
    }

    fn notifier(&self) -> Notify {
        let this = self.this.clone();
        let id = self.id;
        Arc::new(move || {
            let Some(core) = this.upgrade() else {
                return;
            };
            let this = this.clone();
            Batcher::scheduler(core.rank()).schedule(id, move || {
                if let Some(core) = this.upgrade() {
                    core.execute();
                }
            });
        })
    }
}

impl fmt::Debug for EffectCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EffectCore")
            .field("id", &self.id)
            .field("rank", &self.rank.get())
            .field("running", &state.running)
            .field("disposed", &state.disposed)
            .field("dependencies", &state.subscriptions.len())
            .field("run_count", &state.run_count)
            .finish()
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// Clones share the same effect. Dropping the last clone tears it down.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{Effect, Signal};
/// use std::sync::{Arc, Mutex};
///
/// let count = Signal::new(0);
/// let seen = Arc::new(Mutex::new(Vec::new()));
///
/// let effect = {
///     let count = count.clone();
///     let seen = seen.clone();
///     Effect::new(move || seen.lock().unwrap().push(count.get()))
/// };
///
/// count.set(5);
/// assert_eq!(*seen.lock().unwrap(), vec![0, 5]);
/// assert_eq!(effect.run_count(), 2);
/// ```
#[derive(Clone)]
pub struct Effect {
    core: Arc<EffectCore>,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let core = EffectCore::new(run, Arc::new(RankCell::new(Rank::SOURCE.next())));
        core.start();
        Self { core }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.core.id()
    }

    /// Run the effect now, outside of any batch.
    pub fn execute(&self) {
        Tracker::untracked(|| self.core.execute());
    }

    /// Dispose of the effect.
    ///
    /// After disposal, the effect will not run again.
    pub fn dispose(&self) {
        self.core.dispose();
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.core.run_count()
    }

    /// Get the number of dependencies read during the last run.
    pub fn dependency_count(&self) -> usize {
        self.core.dependency_count()
    }

    pub fn rank(&self) -> Rank {
        self.core.rank()
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.core).finish()
    }
}

/// An effect that only runs between [`start`](FastEffect::start) and
/// [`stop`](FastEffect::stop).
#[derive(Clone)]
pub struct FastEffect {
    core: Arc<EffectCore>,
}

impl FastEffect {
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            core: EffectCore::new(run, Arc::new(RankCell::new(Rank::SOURCE.next()))),
        }
    }

    pub(crate) fn with_rank<F>(run: F, rank: Arc<RankCell>) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            core: EffectCore::new(run, rank),
        }
    }

    /// Run once and subscribe to what was read. No-op while running.
    pub fn start(&self) {
        self.core.start();
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn id(&self) -> NodeId {
        self.core.id()
    }

    pub fn rank(&self) -> Rank {
        self.core.rank()
    }

    pub fn run_count(&self) -> usize {
        self.core.run_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.core.dependency_count()
    }

    pub(crate) fn downgrade(&self) -> Weak<EffectCore> {
        Arc::downgrade(&self.core)
    }
}

impl fmt::Debug for FastEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FastEffect").field(&self.core).finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
