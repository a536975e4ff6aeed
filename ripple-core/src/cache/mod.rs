//! Keyed, reference-counted caching of reactive state.
//!
//! - [`IndirectMap`]: a map for keys that only implement `Serialize` and
//!   `PartialEq`.
//! - [`QueriesCache`]: one [`CacheEntry`] per key, evicted according to a
//!   [`CacheLifetime`](crate::config::CacheLifetime) once nothing references
//!   it.

mod indirect_map;
mod reactive_cache;

pub use indirect_map::IndirectMap;
pub use reactive_cache::{CacheEntry, CacheRef, EntryLock, QueriesCache};
