//! Lazy cells.
//!
//! [`LazyComputed`] and [`LazySignal`] only hold a value while something
//! observes them. When the last observer detaches they drop back to
//! [`CellState::Uninitialized`] and release whatever they subscribed to.
//!
//! A collecting read of a [`LazyComputed`] publishes a lease along with the
//! cell. The node stays started while any lease is alive, whether it sits in
//! a collector that has not subscribed yet or in a subscription. Once the
//! last lease is gone and nothing observes the cell, the node stops. A run
//! that reads the node but never subscribes, or panics before it can, leaves
//! nothing behind.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::effect::FastEffect;
use super::signal::{CellInner, CellState};
use super::subscriber::Source;
use super::tracker::Tracker;
use crate::graph::{NodeId, NodeKind, Rank, RankCell};

type Compute<T> = Arc<dyn Fn() -> T + Send + Sync>;

type Release = Arc<dyn Fn() + Send + Sync>;

/// Keeps a lazy node started while alive.
struct Lease {
    _effect: FastEffect,
    leases: Arc<AtomicUsize>,
    release: Release,
}

impl Lease {
    fn new(effect: &FastEffect, leases: &Arc<AtomicUsize>, release: &Release) -> Self {
        leases.fetch_add(1, Ordering::AcqRel);
        Self {
            _effect: effect.clone(),
            leases: leases.clone(),
            release: release.clone(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
            (self.release)();
        }
    }
}

/// A computed value that is only maintained while observed.
///
/// A read from a collecting run starts the internal effect and caches the
/// value. Reads from anywhere else compute the value on the spot when nobody
/// observes it, without caching anything.
pub struct LazyComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    cell: Arc<CellInner<T>>,
    effect: FastEffect,
    compute: Compute<T>,
    leases: Arc<AtomicUsize>,
    release: Release,
}

impl<T> LazyComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let compute: Compute<T> = Arc::new(compute);
        let rank = Arc::new(RankCell::new(Rank::SOURCE.next()));
        let cell = CellInner::new(NodeKind::Derived, CellState::Uninitialized, rank.clone());

        let effect = {
            let target = cell.clone();
            let compute = compute.clone();
            FastEffect::with_rank(move || target.write(compute()), rank)
        };

        let leases = Arc::new(AtomicUsize::new(0));
        let release: Release = {
            let weak_effect = effect.downgrade();
            let weak_cell: Weak<CellInner<T>> = Arc::downgrade(&cell);
            let leases = leases.clone();
            Arc::new(move || {
                let Some(cell) = weak_cell.upgrade() else {
                    return;
                };
                if leases.load(Ordering::Acquire) > 0 || cell.observer_count() > 0 {
                    return;
                }
                if let Some(effect) = weak_effect.upgrade() {
                    effect.stop();
                }
                cell.reset();
                tracing::trace!(node = %cell.id(), "lazy computed released");
            })
        };
        {
            let release = release.clone();
            cell.set_unobserved_hook(move || release());
        }

        Self {
            cell,
            effect,
            compute,
            leases,
            release,
        }
    }

    pub fn id(&self) -> NodeId {
        self.cell.id()
    }

    pub fn get(&self) -> T {
        if Tracker::is_collecting() {
            self.effect.start();
            self.cell
                .track_with(|| Lease::new(&self.effect, &self.leases, &self.release));
            if let Some(value) = self.cell.value() {
                return value;
            }
        }
        self.peek()
    }

    pub fn peek(&self) -> T {
        if self.effect.is_running() {
            if let Some(value) = self.cell.value() {
                return value;
            }
        }
        Tracker::untracked(|| (self.compute)())
    }

    pub fn state(&self) -> CellState<T> {
        self.cell.with(|value| match value {
            Some(value) => CellState::Value(value.clone()),
            None => CellState::Uninitialized,
        })
    }

    pub fn is_running(&self) -> bool {
        self.effect.is_running()
    }

    pub fn rank(&self) -> Rank {
        self.effect.rank()
    }

    pub fn run_count(&self) -> usize {
        self.effect.run_count()
    }

    pub fn observer_count(&self) -> usize {
        self.cell.observer_count()
    }
}

impl<T> Clone for LazyComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            effect: self.effect.clone(),
            compute: Arc::clone(&self.compute),
            leases: Arc::clone(&self.leases),
            release: Arc::clone(&self.release),
        }
    }
}

impl<T> Debug for LazyComputed<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyComputed")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

/// A signal whose value comes from an initializer on first demand.
///
/// When the last observer detaches the value is dropped, and the initializer
/// runs again on the next demand.
pub struct LazySignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    cell: Arc<CellInner<T>>,
    init: Compute<T>,
}

impl<T> LazySignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let cell = CellInner::new(
            NodeKind::Source,
            CellState::Uninitialized,
            Arc::new(RankCell::new(Rank::SOURCE)),
        );

        let weak_cell = Arc::downgrade(&cell);
        cell.set_unobserved_hook(move || {
            if let Some(cell) = weak_cell.upgrade() {
                cell.reset();
            }
        });

        Self {
            cell,
            init: Arc::new(init),
        }
    }

    pub fn id(&self) -> NodeId {
        self.cell.id()
    }

    pub fn get(&self) -> T {
        self.cell.track();
        self.peek()
    }

    pub fn peek(&self) -> T {
        self.cell
            .get_or_init(|| Tracker::untracked(|| (self.init)()))
    }

    /// Initialize or overwrite the value and notify observers.
    pub fn set(&self, value: T) {
        self.cell.write(value);
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.peek());
        self.set(next);
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.is_initialized()
    }

    pub fn observer_count(&self) -> usize {
        self.cell.observer_count()
    }
}

impl<T> Clone for LazySignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            init: Arc::clone(&self.init),
        }
    }
}

impl<T> Debug for LazySignal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySignal")
            .field("id", &self.id())
            .field("value", &self.cell.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Effect, Signal};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting<T: 'static>(
        calls: &Arc<AtomicUsize>,
        f: impl Fn() -> T + Send + Sync + 'static,
    ) -> impl Fn() -> T + Send + Sync + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            f()
        }
    }

    #[test]
    fn unobserved_reads_compute_without_caching() {
        let source = Signal::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = {
            let source = source.clone();
            LazyComputed::new(counting(&calls, move || source.get() * 3))
        };

        assert_eq!(lazy.peek(), 6);
        assert_eq!(lazy.get(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!lazy.is_running());
        assert_eq!(lazy.state(), CellState::Uninitialized);
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn observed_lazy_computed_caches_and_follows_sources() {
        let source = Signal::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = {
            let source = source.clone();
            LazyComputed::new(counting(&calls, move || source.get() + 100))
        };

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let effect = {
            let (lazy, seen) = (lazy.clone(), seen.clone());
            Effect::new(move || seen.lock().push(lazy.get()))
        };

        assert!(lazy.is_running());
        assert_eq!(lazy.state(), CellState::Value(101));
        assert_eq!(effect.rank(), Rank::new(2));

        source.set(2);
        assert_eq!(*seen.lock(), vec![101, 102]);
        assert_eq!(lazy.peek(), 102);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(effect);
        assert!(!lazy.is_running());
        assert_eq!(lazy.state(), CellState::Uninitialized);
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn a_read_nobody_subscribes_to_leaves_the_node_stopped() {
        let source = Signal::new(2);
        let lazy = {
            let source = source.clone();
            LazyComputed::new(move || source.get() + 1)
        };

        let (value, deps) = Tracker::collect(|| lazy.get()).unwrap();
        assert_eq!(value, 3);
        assert!(lazy.is_running());
        drop(deps);

        assert!(!lazy.is_running());
        assert_eq!(lazy.observer_count(), 0);
        assert_eq!(source.observer_count(), 0);
        assert_eq!(lazy.state(), CellState::Uninitialized);

        let runs = lazy.run_count();
        source.set(5);
        assert_eq!(lazy.run_count(), runs);
        assert_eq!(lazy.peek(), 6);
    }

    #[test]
    fn a_run_that_panics_after_the_read_leaves_the_node_stopped() {
        let source = Signal::new(1);
        let lazy = {
            let source = source.clone();
            LazyComputed::new(move || source.get() * 2)
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = Tracker::collect(|| {
                lazy.get();
                panic!("after the read");
            });
        }));
        assert!(result.is_err());
        assert!(!lazy.is_running());
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn a_second_reader_keeps_the_node_when_the_first_leaves() {
        let source = Signal::new(1);
        let lazy = {
            let source = source.clone();
            LazyComputed::new(move || source.get() * 2)
        };
        let first = {
            let lazy = lazy.clone();
            Effect::new(move || {
                lazy.get();
            })
        };
        let second = {
            let lazy = lazy.clone();
            Effect::new(move || {
                lazy.get();
            })
        };
        assert_eq!(lazy.observer_count(), 2);

        drop(first);
        assert!(lazy.is_running());
        source.set(4);
        assert_eq!(lazy.peek(), 8);
        assert_eq!(second.run_count(), 2);

        drop(second);
        assert!(!lazy.is_running());
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn lazy_signal_initializes_on_demand_and_resets_when_unobserved() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = LazySignal::new(counting(&calls, || 7));
        assert!(!lazy.is_initialized());

        let effect = {
            let lazy = lazy.clone();
            Effect::new(move || {
                lazy.get();
            })
        };
        assert!(lazy.is_initialized());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        lazy.set(8);
        assert_eq!(effect.run_count(), 2);
        assert_eq!(lazy.peek(), 8);

        effect.dispose();
        assert!(!lazy.is_initialized());

        assert_eq!(lazy.peek(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn lazy_signal_set_initializes_directly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = LazySignal::new(counting(&calls, || 1));

        lazy.set(5);
        assert_eq!(lazy.get(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
