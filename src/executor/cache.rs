//! Single-flight result cache keyed by input fingerprint.
//!
//! The cache guarantees at-most-one computation per fingerprint: concurrent
//! callers for the same key coalesce onto one in-flight future instead of
//! issuing duplicate agent calls. Failed computations are never cached, so a
//! later caller retries cleanly.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Deterministic fingerprint of `(phase_number, input)`.
///
/// Keys are hashed in sorted order so logically identical inputs always
/// produce the same fingerprint regardless of construction order.
pub fn fingerprint(phase: u8, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update([phase]);
    hash_value(&mut hasher, input);
    format!("{:x}", hasher.finalize())
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hash_value(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
    }
}

/// Concurrent cache where each entry is computed at most once.
#[derive(Debug)]
pub struct SingleFlightCache<T> {
    entries: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for SingleFlightCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> SingleFlightCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cell for a key, created empty if absent.
    ///
    /// Callers run `get_or_try_init` on the returned cell; the lock guards
    /// only the map lookup, never the computation.
    pub fn cell(&self, key: &str) -> Arc<OnceCell<T>> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Peek at a cached value without computing.
    pub fn get(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Drop a key so the next caller recomputes.
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(key);
    }

    /// Number of keys with a completed value.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.values().filter(|c| c.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
