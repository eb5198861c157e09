//! Fragment store: the key-value layer all session state lives in.
//!
//! The store has no TTLs or timers of its own. Values are opaque bytes;
//! callers encode and decode them, deadlines included. `ExpiryTimer` only
//! decides when to look at a key again.
//!
//! Every implementation must make `update` and `remove_if` atomic per key.
//! The session tracker relies on that to serialize connect, status,
//! disconnect and flush for one session without a lock of its own, even
//! across processes sharing one store.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or failed mid-operation.
    #[error("fragment store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key-value storage with per-key atomic read-modify-write.
pub trait FragmentStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a key, returning what it held. Two concurrent deletes of the
    /// same key see the value at most once between them.
    fn delete(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically read and replace one key.
    ///
    /// `f` receives the current value (None if absent) and returns the value
    /// to store, or None to leave the key as it was.
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<&[u8]>) -> Option<Vec<u8>>,
    ) -> Result<(), StoreError>;

    /// Atomically remove a key if `pred` accepts its current value, and
    /// return the removed value. An absent key or a rejected value is left
    /// alone and yields None.
    fn remove_if(
        &self,
        key: &str,
        pred: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// All keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// In-process store. Not durable across restarts.
#[derive(Clone, Default)]
pub struct MemoryFragmentStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryFragmentStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FragmentStore for MemoryFragmentStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.remove(key).map(|(_, v)| v))
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<&[u8]>) -> Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        // The entry guard holds the shard lock for the whole read-modify-write.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Some(next) = f(Some(occupied.get())) {
                    *occupied.get_mut() = next;
                }
            }
            Entry::Vacant(vacant) => {
                if let Some(next) = f(None) {
                    vacant.insert(next);
                }
            }
        }
        Ok(())
    }

    fn remove_if(
        &self,
        key: &str,
        pred: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .remove_if(key, |_, value| pred(value.as_slice()))
            .map(|(_, v)| v))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}
