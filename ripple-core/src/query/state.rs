//! State of one query or operation attempt.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};

use super::transaction::{self, Reconciled, TransactionId, TransactionRecord, TransactionStatus};
use crate::cache::CacheRef;
use crate::error::{QueryError, Result};

/// Bounds shared by every query argument type.
pub trait QueryArgs: Serialize + PartialEq + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> QueryArgs for T where T: Serialize + PartialEq + Clone + fmt::Debug + Send + Sync + 'static {}

/// Bounds shared by every query result type. Results round-trip through JSON
/// so transactions can patch them.
pub trait QueryData: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> QueryData for T where T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Uninitiated,
    Loading,
    Reloading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn is_loading(self) -> bool {
        matches!(self, QueryStatus::Loading | QueryStatus::Reloading)
    }

    /// Neither loading nor waiting to start.
    pub fn is_settled(self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }
}

fn error_message<S: Serializer>(error: &Option<QueryError>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Snapshot of a query entry.
///
/// `data` is always `saved_data` with `transactions` folded on top, and
/// `saved_data` is `None` exactly when `transactions` is.
#[derive(Debug, Clone, Serialize)]
pub struct QueryState<A, D> {
    pub args: A,
    pub data: Option<D>,
    pub saved_data: Option<D>,
    #[serde(serialize_with = "error_message")]
    pub error: Option<QueryError>,
    pub status: QueryStatus,
    pub transactions: Option<Vec<TransactionRecord>>,
    pub lock_count: usize,
}

impl<A, D> QueryState<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    pub fn new(args: A) -> Self {
        Self {
            args,
            data: None,
            saved_data: None,
            error: None,
            status: QueryStatus::Uninitiated,
            transactions: None,
            lock_count: 0,
        }
    }

    /// Enter the loading state. Previous data stays visible while reloading.
    pub(crate) fn loading(mut self) -> Self {
        self.status = match self.status {
            QueryStatus::Uninitiated | QueryStatus::Loading => QueryStatus::Loading,
            QueryStatus::Reloading | QueryStatus::Success | QueryStatus::Error => QueryStatus::Reloading,
        };
        self
    }

    pub(crate) fn succeeded(mut self, data: D) -> Self {
        self.status = QueryStatus::Success;
        self.error = None;
        if let Err(err) = self.rebase(data.clone()) {
            tracing::warn!(error = %err, "pending transactions could not be replayed, dropping them");
            self.data = Some(data);
            self.saved_data = None;
            self.transactions = None;
        }
        self
    }

    pub(crate) fn failed(mut self, error: QueryError) -> Self {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self
    }

    pub(crate) fn with_lock_delta(mut self, delta: isize) -> Self {
        self.lock_count = self.lock_count.saturating_add_signed(delta);
        self
    }

    pub fn has_pending_transactions(&self) -> bool {
        self.transactions
            .iter()
            .flatten()
            .any(|tx| tx.status == TransactionStatus::Pending)
    }

    /// Replace the durable value and replay queued transactions on top.
    pub(crate) fn rebase(&mut self, data: D) -> Result<()> {
        match self.transactions.take() {
            Some(transactions) => {
                let reconciled = transaction::reconcile(serde_json::to_value(&data)?, transactions);
                self.install(reconciled)
            }
            None => {
                self.data = Some(data);
                self.saved_data = None;
                Ok(())
            }
        }
    }

    /// Queue a transaction on top of the current data.
    pub(crate) fn push_transaction(&mut self, record: TransactionRecord) -> Result<()> {
        let base = match self.saved_data.take().or_else(|| self.data.clone()) {
            Some(base) => serde_json::to_value(&base)?,
            None => serde_json::Value::Null,
        };
        let mut transactions = self.transactions.take().unwrap_or_default();
        transactions.push(record);
        self.install(transaction::reconcile(base, transactions))
    }

    /// Resolve a pending transaction. Returns `false` when it is unknown or
    /// already resolved.
    pub(crate) fn resolve_transaction(&mut self, id: TransactionId, status: TransactionStatus) -> Result<bool> {
        let Some(transactions) = self.transactions.as_mut() else {
            return Ok(false);
        };
        let Some(record) = transactions
            .iter_mut()
            .find(|tx| tx.id == id && tx.status == TransactionStatus::Pending)
        else {
            return Ok(false);
        };
        record.status = status;

        let base = match &self.saved_data {
            Some(saved) => serde_json::to_value(saved)?,
            None => serde_json::Value::Null,
        };
        let transactions = self.transactions.take().unwrap_or_default();
        self.install(transaction::reconcile(base, transactions))?;
        Ok(true)
    }

    fn install(&mut self, reconciled: Reconciled) -> Result<()> {
        self.data = match reconciled.data {
            serde_json::Value::Null if self.data.is_none() => None,
            data => Some(serde_json::from_value(data)?),
        };
        self.saved_data = reconciled.saved.map(serde_json::from_value).transpose()?;
        self.transactions = reconciled.transactions;
        Ok(())
    }
}

/// A counted handle on a query entry.
///
/// The entry stays cached while any handle is alive.
pub struct QueryRef<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    entry: CacheRef<QueryState<A, D>>,
}

impl<A, D> QueryRef<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    pub(crate) fn new(entry: CacheRef<QueryState<A, D>>) -> Self {
        Self { entry }
    }

    pub fn entry(&self) -> &CacheRef<QueryState<A, D>> {
        &self.entry
    }

    pub fn label(&self) -> &str {
        self.entry.label()
    }

    /// Tracked read.
    pub fn state(&self) -> QueryState<A, D> {
        self.entry.state()
    }

    pub fn peek(&self) -> QueryState<A, D> {
        self.entry.peek()
    }

    pub fn status(&self) -> QueryStatus {
        self.peek().status
    }

    pub fn data(&self) -> Option<D> {
        self.peek().data
    }

    pub fn error(&self) -> Option<QueryError> {
        self.peek().error
    }

    /// Wait until the entry stops loading, or is evicted.
    pub async fn settled(&self) -> QueryState<A, D> {
        loop {
            let changed = self.entry.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let state = self.peek();
            if !state.status.is_loading() || self.entry.is_evicted() {
                return state;
            }
            changed.await;
        }
    }
}

impl<A, D> Clone for QueryRef<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl<A, D> fmt::Debug for QueryRef<A, D>
where
    A: QueryArgs,
    D: QueryData,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRef")
            .field("label", &self.label())
            .field("status", &self.status())
            .finish()
    }
}
