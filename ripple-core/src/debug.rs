//! Debug sink boundary.
//!
//! A devtools integration implements [`DebugSink`]. Every cache entry created
//! while a sink is configured registers one named state with it and then
//! reports each new state, serialized to JSON.
//!
//! Reports are scheduled at [`Rank::INFINITE`], so a batch that changes an
//! entry several times reports it once, after every regular dependent has
//! settled, with the state as of the flush.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::graph::{Batcher, NodeId, Rank};

/// Callback receiving each new serialized state of one registered name.
pub type StateReporter = Arc<dyn Fn(Value) + Send + Sync>;

/// Receiver of state snapshots, such as a devtools bridge.
pub trait DebugSink: Send + Sync {
    /// Register `name` with its initial state and return the reporter for
    /// its later states.
    fn state(&self, name: &str, initial: Value) -> StateReporter;
}

/// Sink that keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every report so far, registrations included, in arrival order.
    pub fn records(&self) -> Vec<(String, Value)> {
        self.records.lock().clone()
    }

    /// Reports for names starting with `prefix`.
    pub fn records_for(&self, prefix: &str) -> Vec<Value> {
        self.records
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (name, _) in self.records.lock().iter() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

impl DebugSink for MemorySink {
    fn state(&self, name: &str, initial: Value) -> StateReporter {
        self.records.lock().push((name.to_owned(), initial));

        let records = self.records.clone();
        let name = name.to_owned();
        Arc::new(move |value| records.lock().push((name.clone(), value)))
    }
}

type Snapshot = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

/// One registered name on a sink, bound to a way of reading the state.
#[derive(Clone)]
pub(crate) struct DebugChannel {
    id: NodeId,
    reporter: StateReporter,
    snapshot: Snapshot,
}

impl DebugChannel {
    pub(crate) fn open(
        sink: &dyn DebugSink,
        name: &str,
        snapshot: impl Fn() -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        let initial = snapshot().unwrap_or(Value::Null);
        Self {
            id: NodeId::new(),
            reporter: sink.state(name, initial),
            snapshot: Arc::new(snapshot),
        }
    }

    /// Report the state as it is when the current batch flushes.
    pub(crate) fn schedule(&self) {
        let reporter = self.reporter.clone();
        let snapshot = self.snapshot.clone();
        Batcher::scheduler(Rank::INFINITE).schedule(self.id, move || {
            if let Some(value) = snapshot() {
                reporter(value);
            }
        });
    }
}

impl fmt::Debug for DebugChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugChannel").field("id", &self.id).finish()
    }
}
