//! Persisted signals.
//!
//! A [`PersistedSignal`] mirrors its value into a [`KeyValueStore`]. Several
//! signals can share one store key: the stored string is a JSON object and
//! each signal owns one field of it.
//!
//! ```text
//! key "settings"  ->  {"theme": "dark", "font_size": 14}
//!                       ^ subkey        ^ subkey
//! ```

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::signal::Signal;
use crate::error::{Error, Result};
use crate::graph::NodeId;

/// A string key/value store, such as browser local storage or a file.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;

    fn set_item(&self, key: &str, value: String) -> Result<()>;
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw value, bypassing any validation.
    pub fn with_item(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.write().insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: String) -> Result<()> {
        self.items.write().insert(key.to_owned(), value);
        Ok(())
    }
}

/// A signal whose value survives in a [`KeyValueStore`].
pub struct PersistedSignal<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    signal: Signal<T>,
    store: Arc<dyn KeyValueStore>,
    key: String,
    subkey: String,
}

impl<T> PersistedSignal<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Load `subkey` from the object stored under `key`, falling back to
    /// `default` when it is missing or does not deserialize into `T`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        subkey: impl Into<String>,
        default: T,
    ) -> Self {
        let key = key.into();
        let subkey = subkey.into();

        let initial = match load_object(store.as_ref(), &key).remove(&subkey) {
            None => default,
            Some(raw) => match serde_json::from_value::<T>(raw) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(%key, %subkey, error = %err, "stored value failed validation, using default");
                    default
                }
            },
        };

        Self {
            signal: Signal::new(initial),
            store,
            key,
            subkey,
        }
    }

    pub fn id(&self) -> NodeId {
        self.signal.id()
    }

    pub fn get(&self) -> T {
        self.signal.get()
    }

    pub fn peek(&self) -> T {
        self.signal.peek()
    }

    /// Set the value and write it through to the store.
    ///
    /// The in-memory value is updated even when the store rejects the write.
    pub fn set(&self, value: T) -> Result<()> {
        let encoded = serde_json::to_value(&value)?;
        self.signal.set(value);

        let mut object = load_object(self.store.as_ref(), &self.key);
        object.insert(self.subkey.clone(), encoded);
        let serialized = serde_json::to_string(&Value::Object(object))?;
        self.store.set_item(&self.key, serialized).map_err(|err| match err {
            Error::Storage { .. } => err,
            other => Error::Storage {
                key: self.key.clone(),
                message: other.to_string(),
            },
        })
    }

    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.peek());
        self.set(next)
    }

    pub fn observer_count(&self) -> usize {
        self.signal.observer_count()
    }

    /// The underlying signal.
    pub fn signal(&self) -> &Signal<T> {
        &self.signal
    }
}

impl<T> Clone for PersistedSignal<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            subkey: self.subkey.clone(),
        }
    }
}

impl<T> Debug for PersistedSignal<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistedSignal")
            .field("key", &self.key)
            .field("subkey", &self.subkey)
            .field("value", &self.peek())
            .finish()
    }
}

/// Read the JSON object under `key`. Anything unreadable counts as empty.
fn load_object(store: &dyn KeyValueStore, key: &str) -> Map<String, Value> {
    let Some(raw) = store.get_item(key) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(object)) => object,
        Ok(other) => {
            tracing::warn!(%key, found = %other, "stored value is not an object, ignoring it");
            Map::new()
        }
        Err(err) => {
            tracing::warn!(%key, error = %err, "stored value is not valid JSON, ignoring it");
            Map::new()
        }
    }
}
