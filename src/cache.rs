use std::collections::HashMap;
use std::sync::Mutex;

/// String-keyed cache injected into components that memoize remote results.
pub trait Cache<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn set(&self, key: &str, value: V);
    fn clear(&self);
}

/// In-memory cache backed by a mutex-guarded map.
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V> MemoryCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> Cache<V> for MemoryCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value);
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// A cache that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl<V> Cache<V> for NoCache {
    fn get(&self, _key: &str) -> Option<V> {
        None
    }

    fn set(&self, _key: &str, _value: V) {}

    fn clear(&self) {}
}
