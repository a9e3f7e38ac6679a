//! The pluggable persistence port.
//!
//! Shared by the cache, rate-limit, and session middleware and by the
//! router's event deduplication table.  The port is deliberately small:
//! `get`, `set` with optional TTL, `delete`, `clear`.  Durability is
//! whatever the injected backend provides; the default store is
//! process-local.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);
    async fn delete(&self, key: &str);
    async fn clear(&self);
}

// ---------------------------------------------------------------------------
// In-memory default
// ---------------------------------------------------------------------------

struct StoredEntry {
    value: Value,
    expires_at: Option<Instant>,
    last_used: Instant,
}

/// In-memory store with per-entry TTL and LRU eviction at `max_entries`.
pub struct MemoryStore {
    max_entries: usize,
    inner: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        MemoryStore {
            max_entries: max_entries.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict the least-recently-used entry.  Called with the lock held.
    fn evict_one(map: &mut HashMap<String, StoredEntry>) {
        if let Some(oldest) = map
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())
        {
            map.remove(&oldest);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("store lock poisoned");
        let expired = map
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= now));
        if expired {
            map.remove(key);
            return None;
        }
        map.get_mut(key).map(|entry| {
            entry.last_used = now;
            entry.value.clone()
        })
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("store lock poisoned");
        if !map.contains_key(key) && map.len() >= self.max_entries {
            Self::evict_one(&mut map);
        }
        map.insert(
            key.to_owned(),
            StoredEntry {
                value,
                expires_at: ttl.map(|d| now + d),
                last_used: now,
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.inner.lock().expect("store lock poisoned").remove(key);
    }

    async fn clear(&self) {
        self.inner.lock().expect("store lock poisoned").clear();
    }
}
