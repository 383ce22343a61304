//! Namespace-versioned cache keys
//!
//! Every cache key embeds a namespace of the form
//! `<prefix><delimiter><version>`, where `version` is a counter kept in the
//! cache server under `<prefix>_namespace`. Bumping the counter makes every
//! key built from the previous version unreachable at once, without touching
//! the entries themselves. Orphaned entries simply age out through their TTL.

use crate::backend::CacheBackend;
use crate::error::{BouncerError, Result};
use bytes::Bytes;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Cache client that prefixes keys with a versioned namespace
pub struct NamespacedCache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    delimiter: String,
    namespace: RwLock<String>,
}

impl NamespacedCache {
    /// Read (or initialize) the namespace version and build the cache
    ///
    /// The version is read once here and then cached locally; it only
    /// changes again through [`NamespacedCache::invalidate`].
    pub async fn open(
        backend: Arc<dyn CacheBackend>,
        prefix: impl Into<String>,
        delimiter: impl Into<String>,
    ) -> Result<Self> {
        let cache = NamespacedCache {
            backend,
            prefix: prefix.into(),
            delimiter: delimiter.into(),
            namespace: RwLock::new(String::new()),
        };

        let version = cache.get_version().await?;
        cache.store_namespace(&version)?;
        info!("Using cache namespace {}", cache.current_namespace());
        Ok(cache)
    }

    /// Key under which the namespace counter lives
    pub fn namespace_key(&self) -> String {
        format!("{}_namespace", self.prefix)
    }

    /// Read the namespace counter, initializing it to 0 when absent
    pub async fn get_version(&self) -> Result<String> {
        let key = self.namespace_key();
        let stored = self
            .backend
            .get(&key)
            .await?
            .map(|value| String::from_utf8_lossy(&value).trim().to_string())
            .filter(|value| !value.is_empty());

        match stored {
            Some(version) => {
                version.parse::<u64>().map_err(|_| {
                    BouncerError::CacheError(format!(
                        "namespace counter at {} is not a number: {}",
                        key, version
                    ))
                })?;
                Ok(version)
            }
            None => {
                debug!("Initializing namespace counter {}", key);
                self.backend.set(&key, Bytes::from_static(b"0"), 0).await?;
                Ok("0".to_string())
            }
        }
    }

    /// Namespace all keys are currently built from
    pub fn current_namespace(&self) -> String {
        match self.namespace.read() {
            Ok(namespace) => namespace.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Cache key for a user-agent string
    ///
    /// `<namespace><delimiter><hex md5 of the user-agent bytes>`
    ///
    /// Takes the header bytes as received, so user-agents that are not
    /// valid UTF-8 still get distinct keys.
    pub fn cache_key(&self, user_agent: impl AsRef<[u8]>) -> String {
        format!(
            "{}{}{:x}",
            self.current_namespace(),
            self.delimiter,
            md5::compute(user_agent.as_ref())
        )
    }

    /// Bump the namespace counter, orphaning every existing key
    ///
    /// # Arguments
    /// * `delta` - Amount to add to the counter (usually 1)
    ///
    /// # Returns
    /// The new namespace string
    pub async fn invalidate(&self, delta: u64) -> Result<String> {
        let key = self.namespace_key();
        let version = match self.backend.increment(&key, delta).await? {
            Some(version) => version,
            None => {
                // Counter was evicted; restart it at `delta` rather than 0.
                warn!("Namespace counter {} missing, resetting to {}", key, delta);
                self.backend
                    .set(&key, Bytes::from(delta.to_string()), 0)
                    .await?;
                delta
            }
        };

        self.store_namespace(&version.to_string())?;
        let namespace = self.current_namespace();
        info!("Cache namespace invalidated, now {}", namespace);
        Ok(namespace)
    }

    /// Fetch a raw value from the backend
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.backend.get(key).await
    }

    /// Store a raw value in the backend
    pub async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<()> {
        self.backend.set(key, value, ttl_secs).await
    }

    /// Release the backend connection
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    fn store_namespace(&self, version: &str) -> Result<()> {
        let mut namespace = self
            .namespace
            .write()
            .map_err(|e| BouncerError::InternalError(format!("namespace lock poisoned: {}", e)))?;
        *namespace = format!("{}{}{}", self.prefix, self.delimiter, version);
        Ok(())
    }
}
