//! A map keyed by structural equality.
//!
//! Query arguments are arbitrary serializable values without `Hash` or `Ord`.
//! [`IndirectMap`] stores entries in an arena and locates them through a memo
//! from a key's canonical MessagePack encoding to its arena slot.
//!
//! # Lookup
//!
//! 1. Encode the key with `rmp-serde`. A memo hit is confirmed with
//!    `PartialEq` and returned.
//! 2. On a miss, scan the live entries linearly with `PartialEq`. A match is
//!    memoized under the new encoding, so structurally equal keys whose
//!    encodings differ (map fields in another order, for example) resolve to
//!    one entry after a single scan.
//! 3. Keys that cannot be encoded always take the linear scan.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

type Encoded = Vec<u8>;

pub struct IndirectMap<K, V> {
    slots: Vec<Option<(K, V)>>,
    free: Vec<usize>,
    len: usize,
    memo: Mutex<HashMap<Encoded, usize>>,
}

impl<K, V> IndirectMap<K, V>
where
    K: Serialize + PartialEq,
{
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn encode(key: &K) -> Option<Encoded> {
        rmp_serde::to_vec(key).ok()
    }

    fn slot_key(&self, slot: usize) -> Option<&K> {
        self.slots.get(slot)?.as_ref().map(|(k, _)| k)
    }

    /// Find the arena slot holding `key`.
    fn locate(&self, key: &K) -> Option<usize> {
        let encoded = Self::encode(key);

        if let Some(encoded) = &encoded {
            if let Some(&slot) = self.memo.lock().get(encoded) {
                if self.slot_key(slot) == Some(key) {
                    return Some(slot);
                }
            }
        }

        let slot = self
            .slots
            .iter()
            .position(|entry| matches!(entry, Some((k, _)) if k == key))?;

        if let Some(encoded) = encoded {
            self.memo.lock().insert(encoded, slot);
        }
        Some(slot)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.locate(key).is_some()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let slot = self.locate(key)?;
        self.slots[slot].as_ref().map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = self.locate(key)?;
        self.slots[slot].as_mut().map(|(_, v)| v)
    }

    /// Insert, returning the previous value for an equal key.
    ///
    /// The originally stored key is kept when an equal key already exists.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(slot) = self.locate(&key) {
            let entry = self.slots[slot].as_mut()?;
            return Some(std::mem::replace(&mut entry.1, value));
        }

        let encoded = Self::encode(&key);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some((key, value));
                slot
            }
            None => {
                self.slots.push(Some((key, value)));
                self.slots.len() - 1
            }
        };
        if let Some(encoded) = encoded {
            self.memo.get_mut().insert(encoded, slot);
        }
        self.len += 1;
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.locate(key)?;
        let (_, value) = self.slots[slot].take()?;
        self.memo.get_mut().retain(|_, s| *s != slot);
        self.free.push(slot);
        self.len -= 1;
        Some(value)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.memo.get_mut().clear();
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|e| e.as_ref().map(|(k, v)| (k, v)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    #[cfg(test)]
    fn memo_len(&self) -> usize {
        self.memo.lock().len()
    }
}

impl<K, V> Default for IndirectMap<K, V>
where
    K: Serialize + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for IndirectMap<K, V>
where
    K: Serialize + PartialEq + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
