//! Reactive Runtime
//!
//! Free functions over the per-thread tracker and batcher, and the
//! [`Readable`] trait shared by every readable cell.
//!
//! # How It Works
//!
//! 1. [`batch`] groups writes: dependents re-run once, in rank order, when
//!    the outermost batch closes.
//!
//! 2. [`untrack`] reads cells without making them dependencies of the
//!    running effect.
//!
//! 3. [`Readable::watch`] is the adapter boundary for UI bindings and other
//!    consumers: it hands every batch-final value to a plain callback.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::computed::Computed;
use super::effect::Effect;
use super::lazy::{LazyComputed, LazySignal};
use super::persisted::PersistedSignal;
use super::signal::Signal;
use super::tracker::Tracker;
use crate::graph::Batcher;

/// Run `f` inside a batch and return its value.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Batcher::run(f)
}

/// Run `f` without recording any reads as dependencies.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    Tracker::untracked(f)
}

/// A cell that can be read, tracked or not, and watched.
pub trait Readable<T>: Clone + Send + Sync + 'static
where
    T: Clone + Send + Sync + 'static,
{
    /// Tracked read.
    fn get(&self) -> T;

    /// Untracked read.
    fn peek(&self) -> T;

    /// Call `f` with the current value, then with every batch-final value.
    ///
    /// `f` itself runs untracked. Dropping the returned effect stops the
    /// watch.
    fn watch<F>(&self, f: F) -> Effect
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let cell = self.clone();
        Effect::new(move || {
            let value = cell.get();
            untrack(|| f(value));
        })
    }
}

macro_rules! impl_readable {
    ($ty:ident $(, $bound:ident)*) => {
        impl<T> Readable<T> for $ty<T>
        where
            T: Clone + Send + Sync + 'static $(+ $bound)*,
        {
            fn get(&self) -> T {
                $ty::get(self)
            }

            fn peek(&self) -> T {
                $ty::peek(self)
            }
        }
    };
}

impl_readable!(Signal);
impl_readable!(Computed);
impl_readable!(LazySignal);
impl_readable!(LazyComputed);
impl_readable!(PersistedSignal, Serialize, DeserializeOwned);

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn batch_returns_the_closure_value() {
        let signal = Signal::new(1);
        let out = batch(|| {
            signal.set(2);
            signal.peek() * 10
        });
        assert_eq!(out, 20);
    }

    #[test]
    fn untrack_hides_reads_from_the_running_effect() {
        let tracked = Signal::new(0);
        let hidden = Signal::new(0);

        let effect = {
            let (tracked, hidden) = (tracked.clone(), hidden.clone());
            Effect::new(move || {
                tracked.get();
                untrack(|| hidden.get());
            })
        };

        assert_eq!(effect.dependency_count(), 1);
        hidden.set(1);
        assert_eq!(effect.run_count(), 1);
        tracked.set(1);
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn watch_sees_batch_final_values() {
        let a = Signal::new(1);
        let b = Signal::new(10);
        let sum = {
            let (a, b) = (a.clone(), b.clone());
            Computed::new(move || a.get() + b.get())
        };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let watcher = {
            let seen = seen.clone();
            sum.watch(move |v| seen.lock().push(v))
        };

        batch(|| {
            a.set(2);
            b.set(20);
        });
        a.set(3);

        assert_eq!(*seen.lock(), vec![11, 22, 23]);
        drop(watcher);
        a.set(4);
        assert_eq!(seen.lock().len(), 3);
    }

    fn read_twice<R: Readable<i32>>(cell: &R) -> (i32, i32) {
        (cell.get(), cell.peek())
    }

    #[test]
    fn readable_is_implemented_by_every_cell() {
        let signal = Signal::new(2);
        let lazy = LazySignal::new(|| 3);
        let computed = {
            let signal = signal.clone();
            Computed::new(move || signal.get() + 1)
        };
        let lazy_computed = {
            let signal = signal.clone();
            LazyComputed::new(move || signal.get() + 2)
        };

        assert_eq!(read_twice(&signal), (2, 2));
        assert_eq!(read_twice(&lazy), (3, 3));
        assert_eq!(read_twice(&computed), (3, 3));
        assert_eq!(read_twice(&lazy_computed), (4, 4));
    }
}
