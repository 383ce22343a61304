//! Key-value cache backends
//!
//! The caching handler only needs three operations from its cache server:
//! `get`, `set` with a lifetime, and an atomic `increment` for namespace
//! counters. Two backends implement them:
//!
//! - [`MemcachedBackend`]: memcached text protocol over a TCP connection
//! - [`InMemoryBackend`]: process-local map, for single-node use and tests

pub mod memcached;
pub mod memory;

pub use memcached::MemcachedBackend;
pub use memory::InMemoryBackend;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Minimal key-value contract of a cache server
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a value, `None` when the key is absent or expired
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a value; a `ttl_secs` of 0 means no expiry
    async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<()>;

    /// Atomically add `delta` to a numeric value
    ///
    /// Returns the new value, or `None` when the key does not exist.
    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>>;

    /// Release the connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
