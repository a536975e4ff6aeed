//! Error types for the Ripple runtime.
//!
//! Two families live here:
//!
//! - [`Error`]: failures of the runtime itself (tracker misuse, patch replay,
//!   serialization, storage). Returned through [`Result`].
//! - [`QueryError`]: failures of user-supplied query functions. These are
//!   cloneable because they are stored inside query state cells and handed to
//!   every reader.

use std::sync::Arc;

use thiserror::Error;

use crate::query::patch::PatchError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A collecting context was opened while another one was still active on
    /// this thread.
    #[error("a dependency collector is already active on this thread")]
    CollectorBusy,

    /// Applying a structural patch failed.
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),

    /// Converting a value to or from its JSON tree failed.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The persistent store rejected or corrupted a value.
    #[error("storage error for key `{key}`: {message}")]
    Storage { key: String, message: String },
}

/// Error produced by a query or mutation function.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The query function reported a failure.
    #[error("query failed: {0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),

    /// The query function reported a plain message.
    #[error("{0}")]
    Message(String),

    /// The request was superseded or cancelled before it settled.
    #[error("query was cancelled")]
    Cancelled,

    /// No tokio runtime was available to drive the request.
    #[error("no async runtime available to run the query")]
    NoRuntime,
}

impl QueryError {
    /// Wrap any error type.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(error))
    }

    /// Build an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl PartialEq for QueryError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Failed(a), Self::Failed(b)) => Arc::ptr_eq(a, b),
            (Self::Message(a), Self::Message(b)) => a == b,
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::NoRuntime, Self::NoRuntime) => true,
            _ => false,
        }
    }
}
