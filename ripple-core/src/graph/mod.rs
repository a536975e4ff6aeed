//! Dependency Graph
//!
//! Identity, rank and scheduling for the nodes of the reactive graph.
//!
//! # Overview
//!
//! The graph is never materialized as a single structure. Each cell keeps its
//! own observer set, and each effect keeps the subscriptions it made during its
//! last run. What this module provides is the ordering:
//!
//! - Every node carries a [`Rank`]: sources are rank 0, and a derived node is
//!   one above the deepest node it read during its last run.
//! - The [`Batcher`] defers re-runs while a batch is open and flushes them in
//!   ascending rank order, which is a topological order of the affected
//!   sub-graph.
//!
//! # Design Decisions
//!
//! 1. Ranks are re-derived on every run instead of being maintained by a
//!    global graph, because dependencies can change between runs.
//!
//! 2. The queue is keyed by rank and deduplicated by node, so a node reached
//!    through several paths in one batch still runs once.

mod node;
mod scheduler;

pub use node::{NodeId, NodeKind, Rank, RankCell};
pub use scheduler::{Batcher, Scheduler};
