//! UA Bouncer
//!
//! A small HTTP request pipeline whose central stage classifies the client
//! device from its `User-Agent` and caches the outcome in memcached, so each
//! distinct user-agent is classified only once.
//!
//! # Overview
//!
//! Requests run through an ordered list of [`Handler`]s that all write into
//! one shared response. The [`CachingDeviceHandler`] stores only what its
//! device handling added to that response (new or changed headers and new
//! cookies) under a key derived from the MD5 of the user-agent. Cache keys
//! carry a namespace version; bumping the version with a `PURGE` request
//! invalidates every cached classification at once.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ua_bouncer::{BouncerConfig, BouncerServer};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BouncerConfig::from_file("ua_bouncer.yaml")?;
//! let server = Arc::new(BouncerServer::from_config(&config).await?);
//!
//! let listener = tokio::net::TcpListener::bind(&config.listen_address).await?;
//! Arc::clone(&server)
//!     .serve(listener, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "0.0.0.0:8080"
//! handlers:
//!   - type: device
//!     name: ua-map
//!     cookie_name: X-UA-map
//!     cache_key_prefix: uamap
//!     cache_key_delimiter: "#"
//!     cache_entry_ttl: 3600
//!     debug_path: /_debug
//!     memcached:
//!       host: localhost
//!       port: 11211
//! admin:
//!   enabled: true
//!   auth_token: change-me
//! ```
//!
//! See [`BouncerConfig`] for every option.

pub mod backend;
pub mod bounce;
pub mod classifier;
pub mod config;
pub mod device_handler;
pub mod device_handling;
pub mod diff;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod models;
pub mod namespace;
pub mod purge_handler;
pub mod server;

// Re-export commonly used types
pub use backend::{CacheBackend, InMemoryBackend, MemcachedBackend};
pub use bounce::{BounceDecision, BouncePolicy};
pub use classifier::{Classifier, DeviceDescriptor, DeviceRule, RuleClassifier};
pub use config::{BouncerConfig, DeviceHandlerConfig, HandlerConfig};
pub use device_handler::CachingDeviceHandler;
pub use device_handling::{CookieHandling, DeviceHandling, HeaderHandling, TemplateHandling};
pub use diff::{compute_diff, CacheEntry, ResponseSnapshot};
pub use dispatcher::RequestDispatcher;
pub use error::{BouncerError, Result};
pub use handler::{Handler, StaticHandler};
pub use metrics::BouncerMetrics;
pub use models::{BouncerRequest, FinalResponse, ResponseAccumulator};
pub use namespace::NamespacedCache;
pub use purge_handler::{PurgeHandler, PurgeResponse};
pub use server::BouncerServer;
