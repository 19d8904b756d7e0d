//! Substrate call cache.
//!
//! Entries live under a collection name and a fingerprint of their key:
//! the SHA-256 hex of the key's JSON encoding, truncated to 32 characters.
//! The pre-fingerprint source key is kept alongside so callers can clear by
//! prefix. Every operation serializes through one mutex.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::trace;

const FINGERPRINT_LEN: usize = 32;

struct Entry {
    source: String,
    value: Arc<dyn Any + Send + Sync>,
    expires: Instant,
}

#[derive(Default)]
pub struct Cache {
    collections: Mutex<HashMap<String, HashMap<String, Entry>>>,
}

/// Fingerprint of a JSON-encodable key.
pub fn fingerprint<K: Serialize + ?Sized>(key: &K) -> String {
    let encoded = serde_json::to_vec(key).unwrap_or_default();
    let mut hash = hex::encode(Sha256::digest(&encoded));
    hash.truncate(FINGERPRINT_LEN);
    hash
}

/// Text form of a key used for prefix matching. Plain strings are taken as-is.
fn source_key<K: Serialize + ?Sized>(key: &K) -> String {
    match serde_json::to_value(key) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached value, if present, unexpired, and of type `T`.
    pub fn get<T, K>(&self, collection: &str, key: &K) -> Option<T>
    where
        T: Clone + 'static,
        K: Serialize + ?Sized,
    {
        let hash = fingerprint(key);
        let collections = self.collections.lock();
        let entry = collections.get(collection)?.get(&hash)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        trace!(%collection, %hash, "cache hit");
        entry.value.downcast_ref::<T>().cloned()
    }

    pub fn set<T, K>(&self, collection: &str, key: &K, value: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
        K: Serialize + ?Sized,
    {
        let entry = Entry {
            source: source_key(key),
            value: Arc::new(value),
            expires: Instant::now() + ttl,
        };
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(fingerprint(key), entry);
    }

    /// Remove one entry, or with `None` every entry in the collection.
    pub fn clear<K: Serialize + ?Sized>(&self, collection: &str, key: Option<&K>) {
        let mut collections = self.collections.lock();
        match key {
            Some(key) => {
                if let Some(entries) = collections.get_mut(collection) {
                    entries.remove(&fingerprint(key));
                }
            }
            None => {
                collections.remove(collection);
            }
        }
    }

    /// Clear the whole collection.
    pub fn clear_all(&self, collection: &str) {
        self.clear::<str>(collection, None);
    }

    /// Remove every entry whose source key starts with `prefix`.
    pub fn clear_prefix(&self, collection: &str, prefix: &str) {
        if let Some(entries) = self.collections.lock().get_mut(collection) {
            entries.retain(|_, entry| !entry.source.starts_with(prefix));
        }
    }

    /// Number of live and expired entries in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}
