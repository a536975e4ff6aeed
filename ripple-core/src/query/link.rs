//! Links from an operation to the resources it affects.
//!
//! A [`Link`] is prepared once per operation attempt, before the mutation
//! function is called, and the resulting [`LinkInvocation`] is resolved with
//! the attempt's outcome. [`ResourceLink`] is the stock implementation: it can
//! lock its target, apply an optimistic change, write the result back, and
//! reload the target.

use std::fmt;
use std::sync::Arc;

use super::resource::{Resource, ResourceLock, Transaction};
use super::state::{QueryArgs, QueryData};

pub trait Link<A, R>: Send + Sync {
    fn prepare(&self, args: &A) -> Box<dyn LinkInvocation<R>>;
}

/// One attempt's view of a [`Link`].
pub trait LinkInvocation<R>: Send {
    fn succeed(self: Box<Self>, result: &R);
    fn fail(self: Box<Self>);
}

type ForwardArgs<A, TA> = Arc<dyn Fn(&A) -> TA + Send + Sync>;
type OptimisticUpdate<A, TD> = Arc<dyn Fn(&mut TD, &A) + Send + Sync>;
type ResultUpdate<A, R, TD> = Arc<dyn Fn(&mut TD, &R, &A) + Send + Sync>;
type CreateData<A, R, TD> = Arc<dyn Fn(&R, &A) -> TD + Send + Sync>;

/// Binds an operation with arguments `A` and result `R` to a resource keyed
/// by `TA` holding `TD`.
pub struct ResourceLink<A, R, TA, TD>
where
    TA: QueryArgs,
    TD: QueryData,
{
    resource: Resource<TA, TD>,
    forward_args: ForwardArgs<A, TA>,
    lock: bool,
    optimistic_update: Option<OptimisticUpdate<A, TD>>,
    update: Option<ResultUpdate<A, R, TD>>,
    create: Option<CreateData<A, R, TD>>,
    invalidate: bool,
}

impl<A, R, TA, TD> ResourceLink<A, R, TA, TD>
where
    TA: QueryArgs,
    TD: QueryData,
{
    pub fn new(resource: &Resource<TA, TD>, forward_args: impl Fn(&A) -> TA + Send + Sync + 'static) -> Self {
        Self {
            resource: resource.clone(),
            forward_args: Arc::new(forward_args),
            lock: false,
            optimistic_update: None,
            update: None,
            create: None,
            invalidate: false,
        }
    }

    /// Hold the target entry for the duration of the attempt.
    pub fn lock(mut self) -> Self {
        self.lock = true;
        self
    }

    /// Change the target's data before the mutation runs. Committed on
    /// success, aborted on failure.
    pub fn optimistic_update(mut self, f: impl Fn(&mut TD, &A) + Send + Sync + 'static) -> Self {
        self.optimistic_update = Some(Arc::new(f));
        self
    }

    /// Fold the mutation result into the target's data.
    pub fn update(mut self, f: impl Fn(&mut TD, &R, &A) + Send + Sync + 'static) -> Self {
        self.update = Some(Arc::new(f));
        self
    }

    /// Build the target's data from the mutation result when there is
    /// nothing to update.
    pub fn create(mut self, f: impl Fn(&R, &A) -> TD + Send + Sync + 'static) -> Self {
        self.create = Some(Arc::new(f));
        self
    }

    /// Reload the target after success.
    pub fn invalidate(mut self) -> Self {
        self.invalidate = true;
        self
    }
}

impl<A, R, TA, TD> Link<A, R> for ResourceLink<A, R, TA, TD>
where
    A: Clone + Send + Sync + 'static,
    R: 'static,
    TA: QueryArgs,
    TD: QueryData,
{
    fn prepare(&self, args: &A) -> Box<dyn LinkInvocation<R>> {
        let target = (self.forward_args)(args);
        let lock = self.lock.then(|| self.resource.lock(target.clone()));

        let optimistic = self.optimistic_update.as_ref().and_then(|f| {
            self.resource
                .patch(&target, |data| f(data, args))
                .unwrap_or_else(|err| {
                    tracing::warn!(resource = %self.resource.name(), error = %err, "optimistic update failed");
                    None
                })
        });

        Box::new(ResourceLinkInvocation {
            resource: self.resource.clone(),
            args: args.clone(),
            target,
            update: self.update.clone(),
            create: self.create.clone(),
            invalidate: self.invalidate,
            optimistic,
            _lock: lock,
        })
    }
}

impl<A, R, TA, TD> fmt::Debug for ResourceLink<A, R, TA, TD>
where
    TA: QueryArgs,
    TD: QueryData,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLink")
            .field("resource", &self.resource.name())
            .field("lock", &self.lock)
            .field("optimistic_update", &self.optimistic_update.is_some())
            .field("update", &self.update.is_some())
            .field("create", &self.create.is_some())
            .field("invalidate", &self.invalidate)
            .finish()
    }
}

struct ResourceLinkInvocation<A, R, TA, TD>
where
    TA: QueryArgs,
    TD: QueryData,
{
    resource: Resource<TA, TD>,
    args: A,
    target: TA,
    update: Option<ResultUpdate<A, R, TD>>,
    create: Option<CreateData<A, R, TD>>,
    invalidate: bool,
    optimistic: Option<Transaction<TA, TD>>,
    // Released when the invocation is resolved.
    _lock: Option<ResourceLock<TA, TD>>,
}

impl<A, R, TA, TD> ResourceLinkInvocation<A, R, TA, TD>
where
    TA: QueryArgs,
    TD: QueryData,
{
    fn write_result(&self, result: &R) {
        if let Some(update) = &self.update {
            match self.resource.patch(&self.target, |data| update(data, result, &self.args)) {
                Ok(Some(tx)) => {
                    tx.commit();
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(resource = %self.resource.name(), error = %err, "update from operation result failed");
                    return;
                }
            }
        }
        if let Some(create) = &self.create {
            let data = create(result, &self.args);
            drop(self.resource.create(self.target.clone(), data));
        }
    }
}

impl<A, R, TA, TD> LinkInvocation<R> for ResourceLinkInvocation<A, R, TA, TD>
where
    A: Send + Sync + 'static,
    R: 'static,
    TA: QueryArgs,
    TD: QueryData,
{
    fn succeed(self: Box<Self>, result: &R) {
        self.write_result(result);
        if let Some(tx) = &self.optimistic {
            tx.commit();
        }
        if self.invalidate {
            drop(self.resource.reload(&self.target));
        }
    }

    fn fail(self: Box<Self>) {
        if let Some(tx) = &self.optimistic {
            tx.abort();
        }
    }
}
