//! Reactive Primitives
//!
//! This module implements the reactive cells: signals, computed values,
//! effects and their lazy and persisted variants.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is a container for mutable state. Reading it from a tracked
//! run makes it a dependency of that run; writing it re-runs every dependent.
//!
//! ## Computed
//!
//! A [`Computed`] is a derived cell. Its value is produced by an internal
//! effect, so it is always fresh and always initialized.
//!
//! ## Effects
//!
//! An [`Effect`] is a side-effecting computation that re-runs whenever one of
//! the cells it read during its last run changes.
//!
//! # Implementation Notes
//!
//! Reads are collected by the thread-local [`Tracker`]. After a run, the
//! effect subscribes to what it read and takes a rank one above the deepest of
//! them. Writes notify subscribers inside a batch, and the batch re-runs them
//! in rank order, which keeps diamond-shaped graphs glitch-free.

mod computed;
mod effect;
mod lazy;
mod persisted;
mod runtime;
mod signal;
mod subscriber;
mod tracker;

pub use computed::Computed;
pub use effect::{Effect, FastEffect};
pub use lazy::{LazyComputed, LazySignal};
pub use persisted::{KeyValueStore, MemoryStore, PersistedSignal};
pub use runtime::{batch, untrack, Readable};
pub use signal::{CellState, Signal};
pub use subscriber::{Notify, Observers, Source, Subscriber, SubscriberId, Subscription};
pub use tracker::{Dependencies, Dependency, Tracker};
