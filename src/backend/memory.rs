//! In-process cache backend
//!
//! Behaves like a single bounded memcached node held in memory: values expire
//! after their lifetime and are dropped once seen expired, the least recently
//! used entry is evicted when the node is full, and `increment` only works on
//! existing numeric values. Each entry also records its hit count and stored
//! lifetime so tests can observe how the caching handler uses its backend.

use super::CacheBackend;
use crate::error::{BouncerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Entries kept before the least recently used one is evicted
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Clone)]
struct StoredValue {
    data: Bytes,
    ttl_secs: u32,
    expires_at: Option<Instant>,
    last_used: u64,
    hits: u64,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Default)]
struct Storage {
    entries: HashMap<String, StoredValue>,
    clock: u64,
}

impl Storage {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Live entry under `key`; an expired one is removed on the way
    fn live_mut(&mut self, key: &str, now: Instant) -> Option<&mut StoredValue> {
        if self.entries.get(key).is_some_and(|v| v.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Make room for `key` without exceeding `capacity`
    fn reserve(&mut self, key: &str, capacity: usize, now: Instant) {
        if self.entries.contains_key(key) || self.entries.len() < capacity {
            return;
        }
        self.entries.retain(|_, v| !v.is_expired(now));
        while self.entries.len() >= capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            debug!("memory evict: key={}", oldest);
            self.entries.remove(&oldest);
        }
    }
}

/// Cache backend that keeps everything in a local, bounded map
pub struct InMemoryBackend {
    storage: RwLock<Storage>,
    capacity: usize,
    failing: AtomicBool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend holding at most `capacity` entries (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: RwLock::new(Storage::default()),
            capacity: capacity.max(1),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail (or succeed again)
    ///
    /// Simulates an unreachable cache server.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether a live value is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.storage
            .read()
            .map(|s| s.entries.get(key).map(|v| !v.is_expired(now)).unwrap_or(false))
            .unwrap_or(false)
    }

    /// How many `get` calls found a value under `key` while it stayed stored
    pub fn times_hit(&self, key: &str) -> u64 {
        self.storage
            .read()
            .map(|s| s.entries.get(key).map(|v| v.hits).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Lifetime the value under `key` was stored with
    pub fn ttl_of(&self, key: &str) -> Option<u32> {
        self.storage
            .read()
            .ok()
            .and_then(|s| s.entries.get(key).map(|v| v.ttl_secs))
    }

    /// Number of stored entries, including expired ones not yet dropped
    pub fn len(&self) -> usize {
        self.storage.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BouncerError::CacheError(
                "in-memory backend is unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> BouncerError {
        BouncerError::CacheError(format!("Failed to acquire lock: {}", e))
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;
        let now = Instant::now();

        let mut storage = self.storage.write().map_err(Self::lock_error)?;
        let tick = storage.tick();
        let found = storage.live_mut(key, now).map(|value| {
            value.hits += 1;
            value.last_used = tick;
            value.data.clone()
        });

        debug!("memory get: key={}, found={}", key, found.is_some());
        Ok(found)
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<()> {
        self.check_available()?;
        let now = Instant::now();
        let expires_at = if ttl_secs == 0 {
            None
        } else {
            Some(now + Duration::from_secs(u64::from(ttl_secs)))
        };

        let mut storage = self.storage.write().map_err(Self::lock_error)?;
        let hits = storage.live_mut(key, now).map(|v| v.hits).unwrap_or(0);
        storage.reserve(key, self.capacity, now);
        let last_used = storage.tick();
        storage.entries.insert(
            key.to_string(),
            StoredValue {
                data: value,
                ttl_secs,
                expires_at,
                last_used,
                hits,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        self.check_available()?;
        let now = Instant::now();
        let mut storage = self.storage.write().map_err(Self::lock_error)?;
        let tick = storage.tick();

        let Some(stored) = storage.live_mut(key, now) else {
            return Ok(None);
        };

        let current = std::str::from_utf8(&stored.data)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                BouncerError::CacheError(format!(
                    "cannot increment non-numeric value at key {}",
                    key
                ))
            })?;

        let next = current.wrapping_add(delta);
        stored.data = Bytes::from(next.to_string());
        stored.last_used = tick;
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_and_hit_counting() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.times_hit("k"), 0);

        backend.set("k", Bytes::from("v"), 100).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(backend.times_hit("k"), 1);
        assert_eq!(backend.ttl_of("k"), Some(100));
        assert!(backend.contains("k"));
    }

    #[tokio::test]
    async fn test_increment() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.increment("n", 1).await.unwrap(), None);

        backend.set("n", Bytes::from("0"), 0).await.unwrap();
        assert_eq!(backend.increment("n", 1).await.unwrap(), Some(1));
        assert_eq!(backend.increment("n", 5).await.unwrap(), Some(6));
        assert_eq!(backend.get("n").await.unwrap(), Some(Bytes::from("6")));
    }

    #[tokio::test]
    async fn test_increment_non_numeric_fails() {
        let backend = InMemoryBackend::new();
        backend.set("n", Bytes::from("abc"), 0).await.unwrap();
        assert!(backend.increment("n", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let backend = InMemoryBackend::new();
        backend.set_failing(true);
        assert!(backend.get("k").await.unwrap_err().is_cache_error());
        assert!(backend.set("k", Bytes::new(), 0).await.is_err());

        backend.set_failing(false);
        assert!(backend.set("k", Bytes::new(), 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_values_are_dropped() {
        let backend = InMemoryBackend::new();
        backend.set("short", Bytes::from("v"), 1).await.unwrap();
        backend.set("forever", Bytes::from("v"), 0).await.unwrap();
        assert_eq!(backend.len(), 2);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!backend.contains("short"));
        assert_eq!(backend.get("short").await.unwrap(), None);
        assert_eq!(backend.len(), 1);
        assert!(backend.contains("forever"));
    }

    #[tokio::test]
    async fn test_expired_values_make_room_before_eviction() {
        let backend = InMemoryBackend::with_capacity(2);
        backend.set("short", Bytes::from("v"), 1).await.unwrap();
        backend.set("kept", Bytes::from("v"), 0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        backend.set("new", Bytes::from("v"), 0).await.unwrap();
        assert_eq!(backend.len(), 2);
        assert!(backend.contains("kept"));
        assert!(backend.contains("new"));
    }

    #[tokio::test]
    async fn test_full_backend_evicts_least_recently_used() {
        let backend = InMemoryBackend::with_capacity(3);
        for key in ["a", "b", "c"] {
            backend.set(key, Bytes::from(key), 0).await.unwrap();
        }
        backend.get("a").await.unwrap();

        backend.set("d", Bytes::from("d"), 0).await.unwrap();
        assert_eq!(backend.len(), 3);
        assert!(!backend.contains("b"));
        assert!(backend.contains("a"));
        assert!(backend.contains("d"));

        // overwriting a stored key never evicts
        backend.set("a", Bytes::from("a2"), 0).await.unwrap();
        assert_eq!(backend.len(), 3);
        assert!(backend.contains("c"));
    }

    #[tokio::test]
    async fn test_many_distinct_keys_stay_bounded() {
        let backend = InMemoryBackend::with_capacity(16);
        for i in 0..1000 {
            let key = format!("ua-{}", i);
            backend.set(&key, Bytes::from("v"), 100).await.unwrap();
            backend.get(&key).await.unwrap();
        }
        assert_eq!(backend.len(), 16);
        assert_eq!(backend.times_hit("ua-0"), 0);
        assert_eq!(backend.times_hit("ua-999"), 1);
    }

    #[tokio::test]
    async fn test_hit_count_survives_overwrite() {
        let backend = InMemoryBackend::new();
        backend.set("k", Bytes::from("v1"), 0).await.unwrap();
        backend.get("k").await.unwrap();
        backend.set("k", Bytes::from("v2"), 0).await.unwrap();
        backend.get("k").await.unwrap();
        assert_eq!(backend.times_hit("k"), 2);
    }
}
