//! One-shot async mutations.
//!
//! Unlike a [`Resource`](super::Resource), an [`Operation`] never shares or
//! cancels attempts: every [`Operation::initiate`] gets its own state cell,
//! which is dropped with the last [`OperationRef`]. The [`Link`]s registered
//! at construction carry the attempt's effects over to cached resources.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::link::{Link, LinkInvocation};
use super::resource::{boxed_fn, QueryContext, QueryFn};
use super::state::{QueryArgs, QueryData, QueryRef, QueryState, QueryStatus};
use crate::cache::CacheEntry;
use crate::config::{report_error, OperationConfig};
use crate::error::QueryError;

/// Handle on one operation attempt.
pub type OperationRef<A, R> = QueryRef<A, R>;

struct OperationInner<A, R> {
    config: OperationConfig,
    mutate: QueryFn<A, R>,
    links: Vec<Box<dyn Link<A, R>>>,
    serial: AtomicU64,
}

pub struct Operation<A, R> {
    inner: Arc<OperationInner<A, R>>,
}

pub struct OperationBuilder<A, R> {
    config: OperationConfig,
    mutate: QueryFn<A, R>,
    links: Vec<Box<dyn Link<A, R>>>,
}

impl<A, R> OperationBuilder<A, R>
where
    A: QueryArgs,
    R: QueryData,
{
    pub fn link(mut self, link: impl Link<A, R> + 'static) -> Self {
        self.links.push(Box::new(link));
        self
    }

    pub fn build(self) -> Operation<A, R> {
        Operation {
            inner: Arc::new(OperationInner {
                config: self.config,
                mutate: self.mutate,
                links: self.links,
                serial: AtomicU64::new(0),
            }),
        }
    }
}

impl<A, R> Operation<A, R>
where
    A: QueryArgs,
    R: QueryData,
{
    pub fn builder<F, Fut>(config: OperationConfig, mutate: F) -> OperationBuilder<A, R>
    where
        F: Fn(A, QueryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, QueryError>> + Send + 'static,
    {
        OperationBuilder {
            config,
            mutate: boxed_fn(mutate),
            links: Vec::new(),
        }
    }

    /// An operation without links.
    pub fn new<F, Fut>(config: OperationConfig, mutate: F) -> Self
    where
        F: Fn(A, QueryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, QueryError>> + Send + 'static,
    {
        Self::builder(config, mutate).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Start an independent attempt.
    pub fn initiate(&self, args: A) -> OperationRef<A, R> {
        let inner = &self.inner;
        let serial = inner.serial.fetch_add(1, Ordering::Relaxed);
        let encoded = serde_json::to_string(&args).unwrap_or_else(|_| "?".into());
        let label = format!("{}:{}:{}", inner.config.name, serial, encoded);

        let entry = CacheEntry::detached(
            label,
            QueryState::new(args.clone()).loading(),
            inner.config.cache_lifetime(),
            inner.config.debug_sink.as_ref(),
        );
        let handle = entry.retain();

        let invocations: Vec<Box<dyn LinkInvocation<R>>> =
            inner.links.iter().map(|link| link.prepare(&args)).collect();

        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(operation = %entry.label(), "no tokio runtime, operation cannot run");
            settle(&entry, invocations, Err(QueryError::NoRuntime));
            return QueryRef::new(handle);
        };

        tracing::debug!(operation = %entry.label(), links = invocations.len(), "operation started");
        let future = (inner.mutate)(
            args,
            QueryContext {
                cancellation: CancellationToken::new(),
            },
        );
        runtime.spawn(async move {
            let outcome = future.await;
            settle(&entry, invocations, outcome);
        });

        QueryRef::new(handle)
    }

    /// Run an attempt to completion and return its outcome.
    #[deprecated(note = "use `initiate` and read the attempt's state instead")]
    pub async fn mutate(&self, args: A) -> Result<R, QueryError> {
        let state = self.initiate(args).settled().await;
        match (state.status, state.data, state.error) {
            (QueryStatus::Success, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            _ => Err(QueryError::Cancelled),
        }
    }
}

fn settle<A, R>(
    entry: &Arc<CacheEntry<QueryState<A, R>>>,
    invocations: Vec<Box<dyn LinkInvocation<R>>>,
    outcome: Result<R, QueryError>,
) where
    A: QueryArgs,
    R: QueryData,
{
    match outcome {
        Ok(result) => {
            for invocation in invocations {
                invocation.succeed(&result);
            }
            tracing::debug!(operation = %entry.label(), "operation succeeded");
            entry.update(|state| state.clone().succeeded(result));
        }
        Err(error) => {
            for invocation in invocations {
                invocation.fail();
            }
            report_error(entry.label(), &error);
            entry.update(|state| state.clone().failed(error));
        }
    }
}

impl<A, R> Clone for Operation<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> fmt::Debug for Operation<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.inner.config.name)
            .field("links", &self.inner.links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheLifetime, ResourceConfig};
    use crate::query::link::ResourceLink;
    use crate::query::resource::Resource;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Todo {
        title: String,
        done: bool,
    }

    fn todos() -> Resource<u32, Todo> {
        Resource::new(
            ResourceConfig::new("todos").cache_lifetime(CacheLifetime::Forever),
            |id: u32, _| async move {
                Ok(Todo {
                    title: format!("todo {id}"),
                    done: false,
                })
            },
        )
    }

    #[tokio::test]
    async fn attempts_are_independent() {
        let operation: Operation<u32, u32> = Operation::new(OperationConfig::new("double"), |n, _| async move {
            Ok(n * 2)
        });

        let first = operation.initiate(1);
        let second = operation.initiate(1);
        assert_ne!(first.entry().id(), second.entry().id());
        assert_eq!(first.label(), "double:0:1");
        assert_eq!(second.label(), "double:1:1");

        assert_eq!(first.settled().await.data, Some(2));
        assert_eq!(second.settled().await.status, QueryStatus::Success);
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn mutate_returns_the_error() {
        let operation: Operation<u32, u32> =
            Operation::new(OperationConfig::new("broken"), |_, _| async { Err(QueryError::msg("denied")) });
        assert_eq!(operation.mutate(1).await, Err(QueryError::msg("denied")));
    }

    #[tokio::test]
    async fn optimistic_update_is_committed_on_success() {
        let todos = todos();
        todos.create(1, Todo { title: "a".into(), done: false });

        let toggle: Operation<u32, bool> = Operation::builder(OperationConfig::new("toggle"), |_, _| async {
            Ok(true)
        })
        .link(
            ResourceLink::new(&todos, |id: &u32| *id)
                .lock()
                .optimistic_update(|todo: &mut Todo, _| todo.done = true),
        )
        .build();

        let attempt = toggle.initiate(1);
        let state = todos.peek_state(&1).unwrap();
        assert_eq!(state.data.as_ref().map(|t| t.done), Some(true));
        assert_eq!(state.lock_count, 1);
        assert!(state.has_pending_transactions());

        attempt.settled().await;
        let state = todos.peek_state(&1).unwrap();
        assert_eq!(state.data.map(|t| t.done), Some(true));
        assert_eq!(state.transactions, None);
        assert_eq!(state.lock_count, 0);
    }

    #[tokio::test]
    async fn optimistic_update_is_aborted_on_failure() {
        let todos = todos();
        todos.create(1, Todo { title: "a".into(), done: false });

        let toggle: Operation<u32, bool> = Operation::builder(OperationConfig::new("toggle"), |_, _| async {
            Err(QueryError::msg("rejected"))
        })
        .link(ResourceLink::new(&todos, |id: &u32| *id).optimistic_update(|todo: &mut Todo, _| todo.done = true))
        .build();

        let state = toggle.initiate(1).settled().await;
        assert_eq!(state.status, QueryStatus::Error);

        let todo = todos.peek_state(&1).unwrap();
        assert_eq!(todo.data.map(|t| t.done), Some(false));
        assert_eq!(todo.transactions, None);
    }

    #[tokio::test]
    async fn update_create_and_invalidate() {
        let todos = todos();
        todos.create(1, Todo { title: "a".into(), done: false });

        let rename: Operation<(u32, String), String> = Operation::builder(
            OperationConfig::new("rename"),
            |(_, title): (u32, String), _| async move { Ok(title.to_uppercase()) },
        )
        .link(
            ResourceLink::new(&todos, |(id, _): &(u32, String)| *id)
                .update(|todo: &mut Todo, title: &String, _| todo.title = title.clone())
                .create(|title: &String, _| Todo {
                    title: title.clone(),
                    done: false,
                }),
        )
        .build();

        rename.initiate((1, "x".into())).settled().await;
        assert_eq!(todos.peek_state(&1).unwrap().data.map(|t| t.title), Some("X".to_string()));

        rename.initiate((2, "new".into())).settled().await;
        assert_eq!(todos.peek_state(&2).unwrap().data.map(|t| t.title), Some("NEW".to_string()));

        let fetches = Arc::new(AtomicUsize::new(0));
        let counted = fetches.clone();
        let remote: Resource<u32, u32> = Resource::new(
            ResourceConfig::new("remote").cache_lifetime(CacheLifetime::Forever),
            move |id: u32, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                async move { Ok(id) }
            },
        );
        remote.query(7).settled().await;

        let touch: Operation<u32, ()> = Operation::builder(OperationConfig::new("touch"), |_, _| async { Ok(()) })
            .link(ResourceLink::new(&remote, |id: &u32| *id).invalidate())
            .build();
        touch.initiate(7).settled().await;
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}
