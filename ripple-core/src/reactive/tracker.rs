//! Dependency Tracker
//!
//! The tracker records which cells are read while an effect runs. This
//! enables automatic dependency tracking: when a cell is read, it publishes
//! itself and its rank, and the running effect subscribes to it afterwards.
//!
//! # Implementation
//!
//! Each thread has a single collecting slot. [`Tracker::collect`] occupies it
//! for the duration of one run and refuses to start while it is occupied.
//! Code that legitimately starts another run from inside a run (constructing
//! an effect, starting a lazy computed, draining a batch) vacates the slot
//! first with [`Tracker::untracked`] and gets it back afterwards.

use std::cell::RefCell;
use std::sync::Arc;

use smallvec::SmallVec;

use super::subscriber::Source;
use crate::error::{Error, Result};
use crate::graph::{NodeId, Rank};

/// A cell read during a tracked run.
#[derive(Clone)]
pub struct Dependency {
    pub rank: Rank,
    pub source: Arc<dyn Source>,
}

impl Dependency {
    pub fn node_id(&self) -> NodeId {
        self.source.node_id()
    }
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("node", &self.node_id())
            .field("rank", &self.rank)
            .finish()
    }
}

/// Dependencies of one run, in first-read order.
pub type Dependencies = SmallVec<[Dependency; 4]>;

#[derive(Default)]
struct Collector {
    dependencies: Dependencies,
}

impl Collector {
    fn record(&mut self, dependency: Dependency) {
        let id = dependency.node_id();
        match self.dependencies.iter_mut().find(|d| d.node_id() == id) {
            // A node can be re-ranked mid-run; keep the highest rank seen.
            Some(existing) => existing.rank = existing.rank.max(dependency.rank),
            None => self.dependencies.push(dependency),
        }
    }
}

thread_local! {
    static SLOT: RefCell<Option<Collector>> = RefCell::new(None);
}

/// Empties the slot when a collecting run ends, also on unwind.
struct CollectGuard;

impl Drop for CollectGuard {
    fn drop(&mut self) {
        // Dropped dependencies may release nodes; keep the slot unborrowed.
        let abandoned = SLOT.with(|slot| slot.borrow_mut().take());
        drop(abandoned);
    }
}

/// Puts a vacated collector back, also on unwind.
struct RestoreGuard(Option<Collector>);

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let previous = self.0.take();
        SLOT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// The per-thread dependency tracker.
pub struct Tracker;

impl Tracker {
    /// Record a read of `source`. No-op unless a run is collecting.
    pub fn publish(rank: Rank, source: Arc<dyn Source>) {
        SLOT.with(|slot| {
            if let Some(collector) = slot.borrow_mut().as_mut() {
                collector.record(Dependency { rank, source });
            }
        });
    }

    /// Whether a run is collecting on this thread.
    pub fn is_collecting() -> bool {
        SLOT.with(|slot| slot.borrow().is_some())
    }

    /// Run `f` while collecting the cells it reads.
    ///
    /// Fails with [`Error::CollectorBusy`] if another run is already
    /// collecting on this thread.
    pub fn collect<R>(f: impl FnOnce() -> R) -> Result<(R, Dependencies)> {
        SLOT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(Error::CollectorBusy);
            }
            *slot = Some(Collector::default());
            Ok(())
        })?;

        let guard = CollectGuard;
        let value = f();
        let collector = SLOT.with(|slot| slot.borrow_mut().take());
        drop(guard);

        Ok((value, collector.map(|c| c.dependencies).unwrap_or_default()))
    }

    /// Run `f` with the collecting slot vacated, so its reads are not
    /// attributed to the current run.
    pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
        let previous = SLOT.with(|slot| slot.borrow_mut().take());
        let _restore = RestoreGuard(previous);
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::subscriber::{Notify, SubscriberId};

    struct FakeSource(NodeId);

    impl Source for FakeSource {
        fn node_id(&self) -> NodeId {
            self.0
        }
        fn rank(&self) -> Rank {
            Rank::SOURCE
        }
        fn observe(&self, _notify: Notify) -> SubscriberId {
            SubscriberId::new()
        }
        fn unobserve(&self, _id: SubscriberId) {}
        fn observer_count(&self) -> usize {
            0
        }
    }

    fn source() -> Arc<dyn Source> {
        Arc::new(FakeSource(NodeId::new()))
    }

    #[test]
    fn publish_outside_collection_is_ignored() {
        assert!(!Tracker::is_collecting());
        Tracker::publish(Rank::SOURCE, source());
        assert!(!Tracker::is_collecting());
    }

    #[test]
    fn collect_records_reads_once_per_node() {
        let a = source();
        let b = source();

        let (value, deps) = Tracker::collect(|| {
            assert!(Tracker::is_collecting());
            Tracker::publish(Rank::SOURCE, a.clone());
            Tracker::publish(Rank::new(2), b.clone());
            Tracker::publish(Rank::SOURCE, a.clone());
            7
        })
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].node_id(), a.node_id());
        assert_eq!(deps[1].rank, Rank::new(2));
        assert!(!Tracker::is_collecting());
    }

    #[test]
    fn nested_collection_is_rejected() {
        let result = Tracker::collect(|| Tracker::collect(|| ()).map(|_| ()));
        let (inner, _) = result.unwrap();
        assert!(matches!(inner, Err(Error::CollectorBusy)));
    }

    #[test]
    fn untracked_hides_reads_and_restores_the_slot() {
        let a = source();
        let b = source();

        let ((), deps) = Tracker::collect(|| {
            Tracker::untracked(|| {
                assert!(!Tracker::is_collecting());
                Tracker::publish(Rank::SOURCE, a.clone());
                // A fresh run may collect while the outer one is vacated.
                let ((), inner) = Tracker::collect(|| Tracker::publish(Rank::SOURCE, a.clone())).unwrap();
                assert_eq!(inner.len(), 1);
            });
            assert!(Tracker::is_collecting());
            Tracker::publish(Rank::SOURCE, b.clone());
        })
        .unwrap();

        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].node_id(), b.node_id());
    }

    #[test]
    fn slot_is_released_after_panic() {
        let result = std::panic::catch_unwind(|| {
            let _ = Tracker::collect(|| panic!("boom"));
        });
        assert!(result.is_err());
        assert!(!Tracker::is_collecting());
    }
}
