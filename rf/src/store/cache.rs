//! Result cache keyed by request key

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Most recent successful result for a key
///
/// Only successes are ever cached, so an entry carries no status of its own.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: Instant,
}

impl<T> CacheEntry<T> {
    /// Whether the entry is younger than `max_age` at `now`
    ///
    /// Freshness belongs to the read: different callers may ask for different
    /// windows on the same entry.
    pub fn is_fresh(&self, max_age: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < max_age
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Last-write-wins map of cached results
#[derive(Debug)]
pub struct CacheStore<T> {
    entries: HashMap<String, CacheEntry<T>>,
}

impl<T> Default for CacheStore<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> CacheStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for `key` if it is still fresh for a reader allowing `max_age`
    pub fn get_fresh(&self, key: &str, max_age: Duration, now: Instant) -> Option<&T> {
        let entry = self.entries.get(key)?;
        if entry.is_fresh(max_age, now) {
            debug!(%key, age_ms = entry.age(now).as_millis() as u64, "CacheStore::get_fresh: hit");
            Some(&entry.data)
        } else {
            debug!(%key, age_ms = entry.age(now).as_millis() as u64, "CacheStore::get_fresh: stale");
            None
        }
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry<T>> {
        self.entries.get(key)
    }

    /// Store `data` as the newest result for `key`, replacing any previous entry
    pub fn insert(&mut self, key: impl Into<String>, data: T, now: Instant) {
        let key = key.into();
        debug!(%key, "CacheStore::insert: called");
        self.entries.insert(key, CacheEntry { data, created_at: now });
    }

    pub fn remove(&mut self, key: &str) -> bool {
        debug!(%key, "CacheStore::remove: called");
        self.entries.remove(key).is_some()
    }

    /// Drop every entry, returning how many were removed
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        debug!(count, "CacheStore::clear: called");
        self.entries.clear();
        count
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
