//! Ripple Core
//!
//! This crate provides a fine-grained reactive runtime and an async query
//! cache built on it. It implements:
//!
//! - Reactive cells (signals, computeds, effects, lazy and persisted variants)
//! - Glitch-free, rank-ordered batch propagation
//! - A reference-counted cache with time-based eviction
//! - Async resources and operations with optimistic transactions
//!
//! # Architecture
//!
//! - `graph`: node identity, ranks and the batch scheduler
//! - `reactive`: cells and dependency tracking
//! - `cache`: structural-key map and ref-counted cache entries
//! - `query`: resources, operations, patches and transactions
//! - `config`: cache lifetimes, resource and operation settings, error sink
//! - `debug`: state inspection sinks
//! - `error`: crate and query error types
//!
//! # Example
//!
//! ```rust
//! use ripple_core::reactive::{batch, Computed, Effect, Signal};
//!
//! let count = Signal::new(1);
//! let doubled = {
//!     let count = count.clone();
//!     Computed::new(move || count.get() * 2)
//! };
//!
//! let seen = Signal::new(0);
//! let _log = {
//!     let (doubled, seen) = (doubled.clone(), seen.clone());
//!     Effect::new(move || seen.set(doubled.get()))
//! };
//!
//! batch(|| count.set(5));
//! assert_eq!(doubled.peek(), 10);
//! assert_eq!(seen.peek(), 10);
//! ```

pub mod cache;
pub mod config;
pub mod debug;
pub mod error;
pub mod graph;
pub mod query;
pub mod reactive;

pub use config::{CacheLifetime, OperationConfig, ResourceConfig};
pub use error::{Error, QueryError, Result};
pub use query::{Operation, Resource};
pub use reactive::{batch, untrack, Computed, Effect, Readable, Signal};
