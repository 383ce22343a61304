//! Caching device classification handler
//!
//! Classifies the request's device once per distinct user-agent and caches
//! only the response state that the device handling contributed. On a cache
//! hit that contribution is replayed without classifying again.
//!
//! # Request flow
//!
//! 1. Build the cache key from the current namespace and the MD5 of the
//!    raw user-agent bytes.
//! 2. Hit: decode the stored [`CacheEntry`] and apply it.
//! 3. Miss: snapshot the response, classify, run the [`DeviceHandling`]
//!    variant, snapshot again and store the diff.
//! 4. Apply the bounce decision. Status and `Location` are set after the
//!    diff was taken, so they never end up in the cache.
//!
//! Cache failures never fail the request: a failed lookup is a miss and a
//! failed store is logged and skipped.

use crate::backend::{CacheBackend, InMemoryBackend, MemcachedBackend};
use crate::bounce::BouncePolicy;
use crate::classifier::Classifier;
use crate::config::{CacheBackendKind, DeviceHandlerConfig, HandlingConfig};
use crate::device_handling::{CookieHandling, DeviceHandling, HeaderHandling, TemplateHandling};
use crate::diff::{compute_diff, CacheEntry, ResponseSnapshot};
use crate::error::{BouncerError, Result};
use crate::handler::Handler;
use crate::metrics::BouncerMetrics;
use crate::models::{BouncerRequest, ResponseAccumulator};
use crate::namespace::NamespacedCache;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Pipeline handler that caches device classification results
pub struct CachingDeviceHandler {
    config: DeviceHandlerConfig,
    classifier: Arc<dyn Classifier>,
    handling: Box<dyn DeviceHandling>,
    bounce: BouncePolicy,
    /// Backend to use instead of connecting in `setup`
    backend: Option<Arc<dyn CacheBackend>>,
    cache: OnceCell<NamespacedCache>,
    metrics: Option<Arc<BouncerMetrics>>,
}

impl CachingDeviceHandler {
    /// Create a handler with an explicit device handling variant
    pub fn new(
        config: DeviceHandlerConfig,
        classifier: Arc<dyn Classifier>,
        handling: Box<dyn DeviceHandling>,
    ) -> Self {
        let bounce = BouncePolicy::new(config.cookie_name.clone(), config.debug_path.clone());
        CachingDeviceHandler {
            config,
            classifier,
            handling,
            bounce,
            backend: None,
            cache: OnceCell::new(),
            metrics: None,
        }
    }

    /// Create a handler whose variant is selected by `config.handling`
    pub fn from_config(config: DeviceHandlerConfig, classifier: Arc<dyn Classifier>) -> Self {
        let handling: Box<dyn DeviceHandling> = match &config.handling {
            HandlingConfig::Cookie { attribute } => {
                Box::new(CookieHandling::new(config.cookie_name.clone(), attribute.clone()))
            }
            HandlingConfig::Headers => Box::new(HeaderHandling),
            HandlingConfig::Template { template } => Box::new(TemplateHandling::new(template.clone())),
        };
        Self::new(config, classifier, handling)
    }

    /// Use this backend instead of the configured one
    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Enable Prometheus metrics
    pub fn with_metrics(mut self, metrics: Arc<BouncerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DeviceHandlerConfig {
        &self.config
    }

    /// Namespaced cache, available once `setup` has completed
    pub fn cache(&self) -> Result<&NamespacedCache> {
        self.cache.get().ok_or_else(|| {
            BouncerError::handler_failure(&self.config.name, "handler used before setup")
        })
    }

    /// Cache key for a user-agent under the current namespace
    pub fn cache_key(&self, user_agent: impl AsRef<[u8]>) -> Result<String> {
        Ok(self.cache()?.cache_key(user_agent))
    }

    /// Invalidate every cached classification of this handler
    pub async fn invalidate(&self, delta: u64) -> Result<String> {
        self.cache()?.invalidate(delta).await
    }

    async fn connect(&self) -> Result<Arc<dyn CacheBackend>> {
        if let Some(backend) = &self.backend {
            return Ok(Arc::clone(backend));
        }
        match self.config.cache_backend {
            CacheBackendKind::Memcached => {
                let memcached = &self.config.memcached;
                let backend = MemcachedBackend::connect(&memcached.host, memcached.port).await?;
                Ok(Arc::new(backend))
            }
            CacheBackendKind::Memory => Ok(Arc::new(InMemoryBackend::new())),
        }
    }

    /// Look up a cached contribution, treating every failure as a miss
    async fn lookup(&self, cache: &NamespacedCache, cache_key: &str) -> Option<CacheEntry> {
        let cached = match cache.get(cache_key).await {
            Ok(Some(value)) if !value.is_empty() => value,
            Ok(_) => {
                debug!("Cache miss: key={}", cache_key);
                self.record(|m| m.record_cache_miss());
                return None;
            }
            Err(e) => {
                warn!("Cache lookup failed for {}, treating as miss: {}", cache_key, e);
                self.record(|m| m.record_cache_error());
                return None;
            }
        };

        match CacheEntry::decode(&cached) {
            Ok(entry) => {
                debug!("Cache hit: key={}", cache_key);
                self.record(|m| m.record_cache_hit());
                Some(entry)
            }
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", cache_key, e);
                self.record(|m| m.record_cache_error());
                None
            }
        }
    }

    /// Classify, run the device handling and store its diff
    async fn handle_and_cache(
        &self,
        cache: &NamespacedCache,
        cache_key: &str,
        request: &BouncerRequest,
        response: &mut ResponseAccumulator,
    ) -> Result<String> {
        let start = Instant::now();
        let device = self.classifier.classify(&request.user_agent).await?;

        let pre = ResponseSnapshot::capture(response);
        let body = self.handling.apply_device(request, response, &device)?;
        let post = ResponseSnapshot::capture(response);
        self.record(|m| m.record_classification(start.elapsed().as_secs_f64()));

        let entry = compute_diff(&pre, &post).with_body(body.clone());
        debug!(
            "Classified {:?} as {}, caching {} headers and {} cookies under {}",
            request.user_agent,
            device.id,
            entry.headers.len(),
            entry.cookies.len(),
            cache_key
        );

        let stored = match entry.encode() {
            Ok(value) => cache.set(cache_key, value, self.config.cache_entry_ttl).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            warn!("Failed to cache classification under {}: {}", cache_key, e);
            self.record(|m| m.record_store_failure());
        }

        Ok(body)
    }

    fn record(&self, f: impl FnOnce(&BouncerMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}

#[async_trait]
impl Handler for CachingDeviceHandler {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn setup(&self) -> Result<()> {
        self.cache
            .get_or_try_init(|| async {
                let backend = self.connect().await?;
                NamespacedCache::open(
                    backend,
                    self.config.cache_key_prefix.clone(),
                    self.config.cache_key_delimiter.clone(),
                )
                .await
            })
            .await
            .map_err(|e| BouncerError::setup_failure(&self.config.name, e))?;

        info!("Handler '{}' ready", self.config.name);
        Ok(())
    }

    async fn handle(
        &self,
        request: &BouncerRequest,
        response: &mut ResponseAccumulator,
    ) -> Result<String> {
        let cache = self.cache()?;
        let cache_key = cache.cache_key(&request.user_agent_raw);

        let body = match self.lookup(cache, &cache_key).await {
            Some(entry) => entry.apply(response),
            None => self
                .handle_and_cache(cache, &cache_key, request, response)
                .await
                .map_err(|e| BouncerError::handler_failure(&self.config.name, e))?,
        };

        self.bounce.apply(request, response);
        Ok(body)
    }

    async fn teardown(&self) -> Result<()> {
        if let Some(cache) = self.cache.get() {
            cache.close().await?;
        }
        info!("Handler '{}' torn down", self.config.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{DeviceDescriptor, RuleClassifier};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Classifier that counts how often it is asked
    struct CountingClassifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Classifier for CountingClassifier {
        async fn classify(&self, _user_agent: &str) -> Result<DeviceDescriptor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DeviceDescriptor::new("test").with_attribute("tier", "high"))
        }
    }

    fn config() -> DeviceHandlerConfig {
        DeviceHandlerConfig {
            cookie_name: "X-UA-header".to_string(),
            cache_key_prefix: "prefix".to_string(),
            cache_key_delimiter: "_".to_string(),
            cache_entry_ttl: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_handle_before_setup_fails() {
        let handler = CachingDeviceHandler::from_config(config(), Arc::new(RuleClassifier::default()));
        let mut response = ResponseAccumulator::new();
        let result = handler.handle(&BouncerRequest::new("/"), &mut response).await;
        assert!(matches!(result, Err(BouncerError::HandlerFailure { .. })));
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let backend = Arc::new(InMemoryBackend::new());
        let classifier = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
        });
        let handler = CachingDeviceHandler::from_config(config(), classifier.clone())
            .with_backend(backend.clone());
        handler.setup().await.unwrap();

        let request = BouncerRequest::new("/").with_user_agent("UA-X");
        let key = handler.cache_key("UA-X").unwrap();

        let mut first = ResponseAccumulator::new();
        handler.handle(&request, &mut first).await.unwrap();
        assert!(backend.contains(&key));
        assert_eq!(backend.ttl_of(&key), Some(100));

        let mut second = ResponseAccumulator::new();
        handler.handle(&request, &mut second).await.unwrap();

        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.times_hit(&key), 1);
        assert_eq!(first.cookies(), second.cookies());
        assert_eq!(second.cookies(), ["X-UA-header=high"]);
    }

    #[tokio::test]
    async fn test_store_failure_still_serves() {
        let backend = Arc::new(InMemoryBackend::new());
        let handler = CachingDeviceHandler::from_config(config(), Arc::new(RuleClassifier::default()))
            .with_backend(backend.clone());
        handler.setup().await.unwrap();

        backend.set_failing(true);
        let mut response = ResponseAccumulator::new();
        handler
            .handle(&BouncerRequest::new("/").with_user_agent("Nokia3100"), &mut response)
            .await
            .unwrap();
        assert_eq!(response.cookies(), ["X-UA-header=medium"]);
    }

    #[tokio::test]
    async fn test_setup_failure_names_handler() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config();
        config.name = "ua-map".to_string();
        config.memcached.host = "127.0.0.1".to_string();
        config.memcached.port = port;

        let handler = CachingDeviceHandler::from_config(config, Arc::new(RuleClassifier::default()));
        match handler.setup().await {
            Err(BouncerError::SetupFailure { handler, .. }) => assert_eq!(handler, "ua-map"),
            other => panic!("expected setup failure, got {:?}", other.err()),
        }
    }
}
