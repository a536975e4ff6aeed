//! Computed Implementation
//!
//! A Computed is a derived cell whose value is written by an internal
//! effect.
//!
//! # How Computed Values Work
//!
//! 1. The constructor runs the computation synchronously, so the value is
//!    never observably uninitialized.
//!
//! 2. The internal effect subscribes to whatever the computation read. When
//!    one of those cells changes, the effect re-runs at its rank and writes
//!    the new value, which in turn schedules the computed's own observers.
//!
//! 3. The cell shares its rank with the effect, so anything reading a
//!    computed ends up ranked above it.
//!
//! A computed keeps recomputing while it is alive, even with no observers.
//! Dependents that read it keep it alive too, so dropping every handle does
//! not freeze a value that something still observes.
//! Use [`LazyComputed`](super::LazyComputed) for a value that should only be
//! maintained while someone observes it.

use std::fmt::{self, Debug};
use std::sync::Arc;

use super::effect::EffectCore;
use super::signal::{CellInner, CellState};
use super::subscriber::Source;
use crate::graph::{NodeId, NodeKind, Rank, RankCell};

/// A derived value that recomputes when its dependencies change.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{Computed, Signal};
///
/// let count = Signal::new(1);
/// let doubled = {
///     let count = count.clone();
///     Computed::new(move || count.get() * 2)
/// };
///
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    cell: Arc<CellInner<T>>,
    effect: Arc<EffectCore>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a computed value and run `compute` once.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let rank = Arc::new(RankCell::new(Rank::SOURCE.next()));
        let cell = CellInner::new(NodeKind::Derived, CellState::Uninitialized, rank.clone());

        let target = cell.clone();
        let effect = EffectCore::new(move || target.write(compute()), rank);
        effect.start();

        Self { cell, effect }
    }

    pub fn id(&self) -> NodeId {
        self.cell.id()
    }

    /// Get the current value, registering it as a dependency when read from a
    /// collecting run.
    pub fn get(&self) -> T {
        self.cell.track_with(|| self.effect.clone());
        self.peek()
    }

    /// Get the current value without tracking dependencies.
    pub fn peek(&self) -> T {
        self.cell
            .value()
            .expect("computed values are produced in the constructor")
    }

    /// Borrow the current value (tracked).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.cell.track_with(|| self.effect.clone());
        self.cell
            .with(|value| f(value.expect("computed values are produced in the constructor")))
    }

    /// Rank of the internal effect, re-derived on every run.
    pub fn rank(&self) -> Rank {
        self.effect.rank()
    }

    /// How many times the computation has run.
    pub fn run_count(&self) -> usize {
        self.effect.run_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.effect.dependency_count()
    }

    pub fn observer_count(&self) -> usize {
        self.cell.observer_count()
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            effect: Arc::clone(&self.effect),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id())
            .field("kind", &self.cell.kind())
            .field("value", &self.peek())
            .field("rank", &self.rank())
            .finish()
    }
}
