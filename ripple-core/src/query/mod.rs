//! Async queries and mutations on top of the reactive cache.
//!
//! - [`Resource`]: cached reads keyed by arguments.
//! - [`Operation`]: one-shot writes, linked to resources through [`Link`]s.
//! - [`patch`] and [`transaction`]: optimistic changes to cached data.

pub mod hooks;
pub mod link;
pub mod operation;
pub mod patch;
pub mod resource;
pub mod state;
pub mod transaction;

pub use hooks::{CacheEntryAdded, QueryStarted};
pub use link::{Link, LinkInvocation, ResourceLink};
pub use operation::{Operation, OperationBuilder, OperationRef};
pub use patch::{PatchError, PatchOp, Patches, PathSegment};
pub use resource::{QueryContext, QueryFn, Resource, ResourceLock, Transaction};
pub use state::{QueryArgs, QueryData, QueryRef, QueryState, QueryStatus};
pub use transaction::{reconcile, TransactionId, TransactionRecord, TransactionStatus};
