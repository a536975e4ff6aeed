//! Update Scheduler
//!
//! The batcher decides when and in which order dependent nodes re-run.
//!
//! # Algorithm
//!
//! Writes happen inside a batch. While a batch is open, notifications do not
//! run their callbacks; they enqueue them in a rank-ordered queue:
//!
//! 1. A source write notifies its observers, which enqueue their re-run under
//!    their own rank (deduplicated by node, per rank).
//! 2. When the outermost batch closes, the lowest non-empty rank bucket is
//!    taken off the queue and its callbacks are executed.
//! 3. Executing a callback may enqueue more work (at higher ranks, or at a
//!    lower rank when a node's rank was re-derived lower). The lowest bucket
//!    is re-checked after every bucket.
//! 4. [`Rank::INFINITE`] sorts after every real rank, so it only drains once
//!    it is the sole bucket left.
//!
//! Since a node's rank is strictly greater than the rank of everything it
//! reads, every node runs at most once per batch and only after all of its
//! inputs have settled.

use std::cell::RefCell;
use std::collections::BTreeMap;

use indexmap::IndexMap;

use super::node::{NodeId, Rank};
use crate::reactive::Tracker;

type Callback = Box<dyn FnOnce()>;

#[derive(Default)]
struct BatchState {
    open: bool,
    queue: BTreeMap<Rank, IndexMap<NodeId, Callback>>,
}

thread_local! {
    static BATCH: RefCell<BatchState> = RefCell::new(BatchState::default());
}

/// Releases the batch flag and discards queued work, also on unwind.
struct BatchGuard;

impl BatchGuard {
    fn open() -> Self {
        BATCH.with(|batch| batch.borrow_mut().open = true);
        Self
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        BATCH.with(|batch| {
            let mut batch = batch.borrow_mut();
            batch.open = false;
            batch.queue.clear();
        });
    }
}

/// The per-thread batcher.
pub struct Batcher;

impl Batcher {
    /// Run `f` inside a batch.
    ///
    /// The outermost call drains the queue before returning; nested calls run
    /// `f` inline and leave the draining to the outer batch.
    pub fn run<R>(f: impl FnOnce() -> R) -> R {
        if Self::is_batching() {
            return f();
        }

        let guard = BatchGuard::open();
        let result = f();
        Self::drain();
        drop(guard);
        result
    }

    /// Whether a batch is currently open on this thread.
    pub fn is_batching() -> bool {
        BATCH.with(|batch| batch.borrow().open)
    }

    /// Number of callbacks waiting in the queue.
    pub fn pending() -> usize {
        BATCH.with(|batch| batch.borrow().queue.values().map(IndexMap::len).sum())
    }

    /// A scheduler that enqueues work under `rank`.
    pub fn scheduler(rank: Rank) -> Scheduler {
        Scheduler { rank }
    }

    fn drain() {
        loop {
            let next = BATCH.with(|batch| batch.borrow_mut().queue.pop_first());
            let Some((rank, bucket)) = next else {
                break;
            };

            tracing::trace!(%rank, callbacks = bucket.len(), "draining batch bucket");

            for (_, callback) in bucket {
                Tracker::untracked(callback);
            }
        }
    }
}

/// Schedules callbacks at a fixed rank.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    rank: Rank,
}

impl Scheduler {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Run `callback` now if no batch is open, otherwise enqueue it.
    ///
    /// Within one rank bucket only the first callback for a given `id` is
    /// kept.
    pub fn schedule(&self, id: NodeId, callback: impl FnOnce() + 'static) {
        let mut pending = Some(callback);

        BATCH.with(|batch| {
            let mut batch = batch.borrow_mut();
            if !batch.open {
                return;
            }
            if let Some(callback) = pending.take() {
                batch
                    .queue
                    .entry(self.rank)
                    .or_default()
                    .entry(id)
                    .or_insert_with(|| Box::new(callback) as Callback);
            }
        });

        if let Some(callback) = pending {
            self.run_now(id, callback);
        }
    }

    fn run_now(&self, id: NodeId, callback: impl FnOnce()) {
        tracing::trace!(node = %id, rank = %self.rank, "running unbatched callback");
        callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let push = move |label: &'static str| -> Box<dyn FnOnce()> {
            let log = log_clone.clone();
            Box::new(move || log.borrow_mut().push(label))
        };
        (log, push)
    }

    #[test]
    fn schedule_runs_immediately_outside_batch() {
        let (log, push) = recorder();
        Batcher::scheduler(Rank::new(3)).schedule(NodeId::new(), push("now"));
        assert_eq!(*log.borrow(), vec!["now"]);
        assert!(!Batcher::is_batching());
    }

    #[test]
    fn batch_drains_in_rank_order() {
        let (log, push) = recorder();

        Batcher::run(|| {
            assert!(Batcher::is_batching());
            Batcher::scheduler(Rank::INFINITE).schedule(NodeId::new(), push("debug"));
            Batcher::scheduler(Rank::new(2)).schedule(NodeId::new(), push("two"));
            Batcher::scheduler(Rank::new(1)).schedule(NodeId::new(), push("one"));
            assert_eq!(Batcher::pending(), 3);
            assert!(log.borrow().is_empty());
        });

        assert_eq!(*log.borrow(), vec!["one", "two", "debug"]);
        assert_eq!(Batcher::pending(), 0);
        assert!(!Batcher::is_batching());
    }

    #[test]
    fn callbacks_are_deduplicated_per_rank() {
        let (log, push) = recorder();
        let id = NodeId::new();

        Batcher::run(|| {
            Batcher::scheduler(Rank::new(1)).schedule(id, push("first"));
            Batcher::scheduler(Rank::new(1)).schedule(id, push("second"));
            Batcher::scheduler(Rank::new(2)).schedule(id, push("other rank"));
        });

        assert_eq!(*log.borrow(), vec!["first", "other rank"]);
    }

    #[test]
    fn nested_batches_drain_once_at_the_outermost() {
        let (log, push) = recorder();

        Batcher::run(|| {
            Batcher::run(|| {
                Batcher::scheduler(Rank::new(1)).schedule(NodeId::new(), push("inner"));
            });
            // The inner batch must not have drained.
            assert!(log.borrow().is_empty());
        });

        assert_eq!(*log.borrow(), vec!["inner"]);
    }

    #[test]
    fn lower_rank_work_enqueued_during_drain_runs_next() {
        let (log, push) = recorder();
        let push = Rc::new(push);

        Batcher::run(|| {
            let push_inner = push.clone();
            let log_inner = log.clone();
            Batcher::scheduler(Rank::new(5)).schedule(
                NodeId::new(),
                Box::new(move || {
                    log_inner.borrow_mut().push("five");
                    Batcher::scheduler(Rank::new(2)).schedule(NodeId::new(), (*push_inner)("two"));
                }),
            );
            Batcher::scheduler(Rank::new(7)).schedule(NodeId::new(), (*push)("seven"));
        });

        assert_eq!(*log.borrow(), vec!["five", "two", "seven"]);
    }

    #[test]
    fn batch_flag_is_released_after_panic() {
        let result = std::panic::catch_unwind(|| {
            Batcher::run(|| {
                Batcher::scheduler(Rank::new(1)).schedule(NodeId::new(), || {});
                panic!("boom");
            })
        });

        assert!(result.is_err());
        assert!(!Batcher::is_batching());
        assert_eq!(Batcher::pending(), 0);
    }
}
