//! Lifecycle hooks for resources.
//!
//! Hooks are plain callbacks that receive channel ends. They run
//! synchronously when the event happens and can hand the receivers to a
//! spawned task to follow the rest of the lifecycle:
//!
//! - [`QueryStarted`]: fired on every request. `fulfilled` resolves with the
//!   outcome of that request.
//! - [`CacheEntryAdded`]: fired when an entry is created. `data_loaded`
//!   resolves with the first successful value, `data_stream` yields every
//!   successful value, and `entry_removed` resolves on eviction, which also
//!   closes `data_stream`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::error::QueryError;
use crate::graph::NodeId;

pub struct QueryStarted<D> {
    pub fulfilled: oneshot::Receiver<Result<D, QueryError>>,
}

pub struct CacheEntryAdded<D> {
    pub data_loaded: oneshot::Receiver<D>,
    pub entry_removed: oneshot::Receiver<()>,
    pub data_stream: mpsc::UnboundedReceiver<D>,
}

pub type QueryStartedHook<A, D> = Arc<dyn Fn(&A, QueryStarted<D>) + Send + Sync>;
pub type CacheEntryAddedHook<A, D> = Arc<dyn Fn(&A, CacheEntryAdded<D>) + Send + Sync>;

/// Sender side of one [`QueryStarted`] per registered hook.
pub(crate) struct StartedSenders<D> {
    senders: Vec<oneshot::Sender<Result<D, QueryError>>>,
}

impl<D: Clone> StartedSenders<D> {
    pub(crate) fn fulfil(self, outcome: Result<&D, &QueryError>) {
        for sender in self.senders {
            let _ = sender.send(outcome.map(D::clone).map_err(QueryError::clone));
        }
    }
}

struct EntrySenders<D> {
    data_loaded: Option<oneshot::Sender<D>>,
    entry_removed: oneshot::Sender<()>,
    data_stream: mpsc::UnboundedSender<D>,
}

/// Registered hooks plus the live channels of every hooked entry.
pub(crate) struct Hooks<A, D> {
    query_started: RwLock<Vec<QueryStartedHook<A, D>>>,
    cache_entry_added: RwLock<Vec<CacheEntryAddedHook<A, D>>>,
    entries: Mutex<HashMap<NodeId, Vec<EntrySenders<D>>>>,
}

impl<A, D: Clone> Hooks<A, D> {
    pub(crate) fn new() -> Self {
        Self {
            query_started: RwLock::new(Vec::new()),
            cache_entry_added: RwLock::new(Vec::new()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add_query_started(&self, hook: QueryStartedHook<A, D>) {
        self.query_started.write().push(hook);
    }

    pub(crate) fn add_cache_entry_added(&self, hook: CacheEntryAddedHook<A, D>) {
        self.cache_entry_added.write().push(hook);
    }

    pub(crate) fn query_started(&self, args: &A) -> StartedSenders<D> {
        let hooks = self.query_started.read().clone();
        let mut senders = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let (sender, fulfilled) = oneshot::channel();
            senders.push(sender);
            hook(args, QueryStarted { fulfilled });
        }
        StartedSenders { senders }
    }

    /// Run the entry-added hooks. Returns whether any hook is listening.
    pub(crate) fn entry_added(&self, entry: NodeId, args: &A) -> bool {
        let hooks = self.cache_entry_added.read().clone();
        if hooks.is_empty() {
            return false;
        }

        let mut senders = Vec::with_capacity(hooks.len());
        let mut receivers = Vec::with_capacity(hooks.len());
        for _ in &hooks {
            let (loaded_tx, data_loaded) = oneshot::channel();
            let (removed_tx, entry_removed) = oneshot::channel();
            let (stream_tx, data_stream) = mpsc::unbounded_channel();
            senders.push(EntrySenders {
                data_loaded: Some(loaded_tx),
                entry_removed: removed_tx,
                data_stream: stream_tx,
            });
            receivers.push(CacheEntryAdded {
                data_loaded,
                entry_removed,
                data_stream,
            });
        }
        self.entries.lock().insert(entry, senders);

        for (hook, added) in hooks.iter().zip(receivers) {
            hook(args, added);
        }
        true
    }

    pub(crate) fn data_loaded(&self, entry: NodeId, data: &D) {
        let mut entries = self.entries.lock();
        let Some(senders) = entries.get_mut(&entry) else {
            return;
        };
        for sender in senders.iter_mut() {
            if let Some(loaded) = sender.data_loaded.take() {
                let _ = loaded.send(data.clone());
            }
            let _ = sender.data_stream.send(data.clone());
        }
    }

    pub(crate) fn entry_removed(&self, entry: NodeId) {
        let senders = self.entries.lock().remove(&entry);
        for sender in senders.into_iter().flatten() {
            let _ = sender.entry_removed.send(());
        }
    }
}
