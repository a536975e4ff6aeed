//! Graph Nodes
//!
//! Identity and topological rank for the cells of the dependency graph.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A writable cell. Always rank 0.
    Source,

    /// A cell whose value is produced by an effect.
    Derived,

    /// A subscriber that only produces side effects.
    Effect,
}

/// Topological depth of a node.
///
/// Sources sit at rank 0, and every derived node sits one above the deepest
/// node it read during its last run. [`Rank::INFINITE`] is reserved for
/// out-of-band work (debug reporting) that must run after all ordinary
/// propagation in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rank(u32);

impl Rank {
    /// Rank of writable sources.
    pub const SOURCE: Rank = Rank(0);

    /// Sentinel drained only once nothing else is queued.
    pub const INFINITE: Rank = Rank(u32::MAX);

    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_infinite(self) -> bool {
        self == Self::INFINITE
    }

    /// The rank of a node that depends on `self`.
    pub fn next(self) -> Rank {
        if self.is_infinite() {
            return self;
        }
        Rank(self.0.saturating_add(1).min(u32::MAX - 1))
    }

    /// Rank of a node whose last run read exactly `deps`.
    pub fn above<I>(deps: I) -> Rank
    where
        I: IntoIterator<Item = Rank>,
    {
        deps.into_iter()
            .max()
            .unwrap_or(Rank::SOURCE)
            .next()
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Rank storage shared between an effect and the cell it feeds.
#[derive(Debug, Default)]
pub struct RankCell(AtomicU32);

impl RankCell {
    pub fn new(rank: Rank) -> Self {
        Self(AtomicU32::new(rank.get()))
    }

    pub fn get(&self) -> Rank {
        Rank(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, rank: Rank) {
        self.0.store(rank.get(), Ordering::Release);
    }
}
