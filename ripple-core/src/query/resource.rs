//! Cached, deduplicated async queries.
//!
//! A [`Resource`] owns a [`QueriesCache`] keyed by query arguments. Each
//! entry holds a [`QueryState`] cell that readers track like any other
//! signal. Requests run on the ambient tokio runtime; starting a new request
//! for a key cancels the one in flight, and a result that arrives after its
//! request was superseded is dropped.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::hooks::{CacheEntryAdded, Hooks, QueryStarted, StartedSenders};
use super::patch;
use super::state::{QueryArgs, QueryData, QueryRef, QueryState, QueryStatus};
use super::transaction::{TransactionId, TransactionRecord, TransactionStatus};
use crate::cache::{CacheEntry, CacheRef, EntryLock, QueriesCache};
use crate::config::{report_error, ResourceConfig};
use crate::error::{QueryError, Result};

/// Handed to every query function call.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub cancellation: CancellationToken,
}

impl QueryContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the request is superseded or its entry evicted.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

pub type QueryFn<A, D> = Arc<dyn Fn(A, QueryContext) -> BoxFuture<'static, Result<D, QueryError>> + Send + Sync>;

pub(crate) fn boxed_fn<A, D, F, Fut>(f: F) -> QueryFn<A, D>
where
    F: Fn(A, QueryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, QueryError>> + Send + 'static,
{
    Arc::new(move |args, ctx| f(args, ctx).boxed())
}

type Entry<A, D> = CacheEntry<QueryState<A, D>>;

struct ResourceInner<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    config: ResourceConfig,
    fetch: QueryFn<A, D>,
    cache: QueriesCache<A, QueryState<A, D>>,
    hooks: Arc<Hooks<A, D>>,
}

pub struct Resource<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    inner: Arc<ResourceInner<A, D>>,
}

impl<A, D> Resource<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    pub fn new<F, Fut>(config: ResourceConfig, fetch: F) -> Self
    where
        F: Fn(A, QueryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, QueryError>> + Send + 'static,
    {
        let cache = QueriesCache::new(config.name.clone(), config.cache_lifetime, config.debug_sink.clone());
        Self {
            inner: Arc::new(ResourceInner {
                config,
                fetch: boxed_fn(fetch),
                cache,
                hooks: Arc::new(Hooks::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &QueriesCache<A, QueryState<A, D>> {
        &self.inner.cache
    }

    /// Run `hook` at the start of every request.
    pub fn on_query_started(&self, hook: impl Fn(&A, QueryStarted<D>) + Send + Sync + 'static) {
        self.inner.hooks.add_query_started(Arc::new(hook));
    }

    /// Run `hook` whenever an entry is created.
    pub fn on_cache_entry_added(&self, hook: impl Fn(&A, CacheEntryAdded<D>) + Send + Sync + 'static) {
        self.inner.hooks.add_cache_entry_added(Arc::new(hook));
    }

    fn acquire(&self, args: &A) -> CacheRef<QueryState<A, D>> {
        let (entry, created) = self.inner.cache.acquire(args, |args| QueryState::new(args.clone()));
        if created && self.inner.hooks.entry_added(entry.id(), args) {
            let hooks = Arc::downgrade(&self.inner.hooks);
            let id = entry.id();
            entry.on_evict(move || {
                if let Some(hooks) = hooks.upgrade() {
                    hooks.entry_removed(id);
                }
            });
        }
        entry
    }

    /// Fetch `args`, cancelling any request in flight for the same key.
    pub fn initiate(&self, args: A) -> QueryRef<A, D> {
        let entry = self.acquire(&args);
        self.inner.start(entry.entry(), args);
        QueryRef::new(entry)
    }

    /// Fetch `args` only if the entry has never been loaded.
    pub fn query(&self, args: A) -> QueryRef<A, D> {
        let entry = self.acquire(&args);
        if entry.peek().status == QueryStatus::Uninitiated {
            self.inner.start(entry.entry(), args);
        }
        QueryRef::new(entry)
    }

    /// Refetch `args` if it is cached.
    pub fn reload(&self, args: &A) -> Option<QueryRef<A, D>> {
        let entry = self.inner.cache.get(args)?.retain();
        self.inner.start(entry.entry(), args.clone());
        Some(QueryRef::new(entry))
    }

    /// Keep the entry for `args` cached until the guard drops.
    pub fn lock(&self, args: A) -> ResourceLock<A, D> {
        let entry = self.acquire(&args);
        let lock = entry.lock();
        entry.update(|state| state.clone().with_lock_delta(1));
        ResourceLock { lock }
    }

    /// Apply `recipe` to the cached data as a pending transaction.
    ///
    /// Returns `Ok(None)` when `args` is not cached or has no data yet.
    pub fn patch(&self, args: &A, recipe: impl FnOnce(&mut D)) -> Result<Option<Transaction<A, D>>> {
        let Some(entry) = self.inner.cache.get(args) else {
            return Ok(None);
        };
        let queued = entry.try_update(|state| -> Result<Option<TransactionId>> {
            let Some(data) = state.data.as_ref() else {
                return Ok(None);
            };
            let (_, forward, inverse) = patch::produce(data, recipe)?;
            let record = TransactionRecord::pending(forward, inverse);
            let id = record.id;
            state.push_transaction(record)?;
            Ok(Some(id))
        })?;
        let Some(id) = queued else {
            return Ok(None);
        };

        tracing::trace!(entry = %entry.label(), transaction = %id, "transaction queued");
        Ok(Some(Transaction {
            entry: Arc::downgrade(&entry),
            id,
        }))
    }

    /// Store `data` for `args` as if a request had just succeeded.
    pub fn create(&self, args: A, data: D) -> QueryRef<A, D> {
        let entry = self.acquire(&args);
        entry.update(|state| state.clone().succeeded(data.clone()));
        self.inner.hooks.data_loaded(entry.id(), &data);
        QueryRef::new(entry)
    }

    /// Tracked read of the state cached for `args`.
    pub fn state(&self, args: &A) -> Option<QueryState<A, D>> {
        self.inner.cache.get(args).map(|entry| entry.state())
    }

    pub fn peek_state(&self, args: &A) -> Option<QueryState<A, D>> {
        self.inner.cache.get(args).map(|entry| entry.peek())
    }

    pub fn contains(&self, args: &A) -> bool {
        self.inner.cache.contains(args)
    }

    /// Evict the entry for `args`.
    pub fn remove(&self, args: &A) -> bool {
        self.inner.cache.remove(args)
    }
}

impl<A, D> ResourceInner<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    fn start(self: &Arc<Self>, entry: &Arc<Entry<A, D>>, args: A) {
        let (request, token) = entry.begin_request();
        entry.update(|state| state.clone().loading());
        let started = self.hooks.query_started(&args);

        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(entry = %entry.label(), "no tokio runtime, query cannot run");
            self.settle(entry, request, Err(QueryError::NoRuntime), started);
            return;
        };

        tracing::debug!(entry = %entry.label(), request, "query started");
        let future = (self.fetch)(
            args,
            QueryContext {
                cancellation: token.clone(),
            },
        );
        let inner = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        handle.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(QueryError::Cancelled),
                result = future => result,
            };
            if let (Some(inner), Some(entry)) = (inner.upgrade(), weak_entry.upgrade()) {
                inner.settle(&entry, request, outcome, started);
            }
        });
    }

    fn settle(
        &self,
        entry: &Arc<Entry<A, D>>,
        request: u64,
        outcome: Result<D, QueryError>,
        started: StartedSenders<D>,
    ) {
        if !entry.finish_request(request) {
            tracing::warn!(entry = %entry.label(), request, "ignoring result of a superseded request");
            started.fulfil(Err(&QueryError::Cancelled));
            return;
        }

        match outcome {
            Ok(data) => {
                tracing::debug!(entry = %entry.label(), request, "query succeeded");
                entry.update(|state| state.clone().succeeded(data.clone()));
                self.hooks.data_loaded(entry.id(), &data);
                started.fulfil(Ok(&data));
            }
            Err(error) => {
                entry.update(|state| state.clone().failed(error.clone()));
                report_error(entry.label(), &error);
                started.fulfil(Err(&error));
            }
        }
    }
}

impl<A, D> Clone for Resource<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, D> fmt::Debug for Resource<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.inner.config.name)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

/// Keeps a resource entry cached while alive.
pub struct ResourceLock<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    lock: EntryLock<QueryState<A, D>>,
}

impl<A, D> ResourceLock<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    pub fn entry(&self) -> &Arc<Entry<A, D>> {
        self.lock.entry()
    }
}

impl<A, D> Drop for ResourceLock<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    fn drop(&mut self) {
        let entry = self.lock.entry();
        if !entry.is_evicted() {
            entry.update(|state| state.clone().with_lock_delta(-1));
        }
    }
}

/// A pending optimistic change to one cached entry.
pub struct Transaction<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    entry: Weak<Entry<A, D>>,
    id: TransactionId,
}

impl<A, D> Transaction<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Keep the change. It folds into the durable value once no pending
    /// transaction is queued after it.
    pub fn commit(&self) {
        self.resolve(TransactionStatus::Committed);
    }

    /// Revert the change.
    pub fn abort(&self) {
        self.resolve(TransactionStatus::Aborted);
    }

    fn resolve(&self, status: TransactionStatus) {
        let Some(entry) = self.entry.upgrade() else {
            return;
        };
        let resolved = entry.try_update(|state| {
            state
                .resolve_transaction(self.id, status)
                .map(|changed| changed.then_some(()))
        });
        match resolved {
            Ok(Some(())) => {
                tracing::trace!(entry = %entry.label(), transaction = %self.id, ?status, "transaction resolved");
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(entry = %entry.label(), transaction = %self.id, error = %err, "transaction could not be resolved");
            }
        }
    }
}

impl<A, D> fmt::Debug for Transaction<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheLifetime;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: i32,
    }

    fn counter_resource(lifetime: CacheLifetime) -> (Resource<u32, Counter>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let resource = Resource::new(
            ResourceConfig::new("counter").cache_lifetime(lifetime),
            move |id: u32, _ctx: QueryContext| {
                counted.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Counter { count: id as i32 }) }
            },
        );
        (resource, calls)
    }

    #[tokio::test]
    async fn initiate_loads_then_succeeds() {
        let (resource, calls) = counter_resource(CacheLifetime::Forever);
        let query = resource.initiate(3);
        assert_eq!(query.status(), QueryStatus::Loading);

        let state = query.settled().await;
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(Counter { count: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_reuses_loaded_entries() {
        let (resource, calls) = counter_resource(CacheLifetime::Forever);
        resource.query(1).settled().await;
        let again = resource.query(1);
        assert_eq!(again.status(), QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let reloaded = resource.reload(&1).unwrap();
        assert_eq!(reloaded.status(), QueryStatus::Reloading);
        assert_eq!(reloaded.data(), Some(Counter { count: 1 }));
        reloaded.settled().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(resource.reload(&9).is_none());
    }

    #[test]
    fn without_a_runtime_the_query_fails() {
        let (resource, calls) = counter_resource(CacheLifetime::Forever);
        let query = resource.initiate(1);
        assert_eq!(query.status(), QueryStatus::Error);
        assert_eq!(query.error(), Some(QueryError::NoRuntime));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn errors_are_stored_not_returned() {
        let resource: Resource<u32, Counter> = Resource::new(ResourceConfig::new("failing"), |_, _| async {
            Err(QueryError::msg("offline"))
        });
        let state = resource.initiate(1).settled().await;
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.error, Some(QueryError::msg("offline")));
        assert_eq!(state.data, None);
    }

    #[test]
    fn patch_without_data_is_none() {
        let (resource, _) = counter_resource(CacheLifetime::Forever);
        assert!(resource.patch(&1, |c| c.count += 1).unwrap().is_none());

        let _lock = resource.lock(1);
        assert!(resource.patch(&1, |c| c.count += 1).unwrap().is_none());
    }

    #[test]
    fn optimistic_patch_commit_and_abort() {
        let (resource, _) = counter_resource(CacheLifetime::Forever);
        let _entry = resource.create(1, Counter { count: 0 });

        let tx = resource.patch(&1, |c| c.count = 1).unwrap().unwrap();
        let state = resource.peek_state(&1).unwrap();
        assert_eq!(state.data, Some(Counter { count: 1 }));
        assert_eq!(state.saved_data, Some(Counter { count: 0 }));

        tx.abort();
        let state = resource.peek_state(&1).unwrap();
        assert_eq!(state.data, Some(Counter { count: 0 }));
        assert_eq!(state.transactions, None);

        // Already resolved.
        tx.commit();
        assert_eq!(resource.peek_state(&1).unwrap().data, Some(Counter { count: 0 }));

        let tx = resource.patch(&1, |c| c.count = 7).unwrap().unwrap();
        tx.commit();
        let state = resource.peek_state(&1).unwrap();
        assert_eq!(state.data, Some(Counter { count: 7 }));
        assert_eq!(state.saved_data, None);
    }

    #[test]
    fn patches_from_many_threads_all_land() {
        let (resource, _) = counter_resource(CacheLifetime::Forever);
        let _entry = resource.create(1, Counter { count: 0 });

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let resource = resource.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let tx = resource.patch(&1, |c| c.count += 1).unwrap().unwrap();
                        tx.commit();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let state = resource.peek_state(&1).unwrap();
        assert_eq!(state.data, Some(Counter { count: 100 }));
        assert_eq!(state.transactions, None);
    }

    #[test]
    fn lock_tracks_its_count_and_prevents_eviction() {
        let (resource, _) = counter_resource(CacheLifetime::Immediate);
        let lock = resource.lock(5);
        assert_eq!(resource.peek_state(&5).unwrap().lock_count, 1);
        assert_eq!(lock.entry().lock_count(), 1);

        let second = resource.lock(5);
        assert_eq!(resource.peek_state(&5).unwrap().lock_count, 2);
        drop(second);
        assert_eq!(resource.peek_state(&5).unwrap().lock_count, 1);

        drop(lock);
        assert!(!resource.contains(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_cancels_the_request() {
        let resource: Resource<u32, Counter> = Resource::new(
            ResourceConfig::new("slow").cache_lifetime(CacheLifetime::Immediate),
            |id, _ctx: QueryContext| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Counter { count: id as i32 })
            },
        );
        let query = resource.initiate(1);
        let entry = query.entry().entry().clone();
        drop(query);

        assert!(entry.is_evicted());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(entry.peek().status, QueryStatus::Loading);
    }
}
