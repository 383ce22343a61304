//! Configuration management for the UA bouncer

use crate::backend::memcached::{DEFAULT_PORT, MAX_RELATIVE_EXPIRY};
use crate::classifier::{default_rules, DeviceRule};
use crate::error::{BouncerError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BouncerConfig {
    /// Address the HTTP server binds to (default: 127.0.0.1:8080)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Ordered request pipeline
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,

    /// User-agent classification rules
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Admin purge endpoint
    #[serde(default)]
    pub admin: AdminConfig,

    /// Whether to serve Prometheus metrics at /metrics (default: true)
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// One pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// Caching device classification handler
    Device(DeviceHandlerConfig),
    /// Fixed headers, cookies and body
    Static(StaticHandlerConfig),
}

/// Configuration of the caching device classification handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandlerConfig {
    /// Handler name used in logs and metrics (default: "device")
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Name of the identification cookie (default: "X-UA-map")
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Prefix of every cache key (default: "")
    #[serde(default, alias = "cache_prefix")]
    pub cache_key_prefix: String,

    /// Delimiter between key components (default: "#")
    #[serde(default = "default_delimiter", alias = "cache_prefix_delimiter")]
    pub cache_key_delimiter: String,

    /// Lifetime of cache entries in seconds, 0 for no expiry (default: 0)
    #[serde(default, alias = "cache_lifetime")]
    pub cache_entry_ttl: u32,

    /// Path that is always served directly, never bounced
    #[serde(default)]
    pub debug_path: Option<String>,

    /// Which cache server to use (default: memcached)
    #[serde(default)]
    pub cache_backend: CacheBackendKind,

    /// Memcached connection parameters
    #[serde(default)]
    pub memcached: MemcachedConfig,

    /// What to do with a classified device (default: cookie from `tier`)
    #[serde(default)]
    pub handling: HandlingConfig,
}

/// Cache server selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    #[default]
    Memcached,
    Memory,
}

/// Memcached connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemcachedConfig {
    /// Server host (default: "localhost")
    #[serde(default = "default_memcached_host")]
    pub host: String,

    /// Server port (default: 11211)
    #[serde(default = "default_memcached_port")]
    pub port: u16,
}

/// Device handling variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlingConfig {
    /// Set `<cookie_name>=<attribute value>`
    Cookie {
        #[serde(default = "default_attribute")]
        attribute: String,
    },
    /// Set `X-UA-*` headers from the descriptor
    Headers,
    /// Render a body fragment
    Template { template: String },
}

/// Configuration of a fixed-contribution handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticHandlerConfig {
    #[serde(default = "default_static_name")]
    pub name: String,

    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,

    #[serde(default)]
    pub cookies: std::collections::BTreeMap<String, String>,

    #[serde(default)]
    pub body: String,
}

/// Classifier rules; the built-in rules are used when empty
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub rules: Vec<DeviceRule>,
}

/// Configuration for namespace purge requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Whether PURGE requests are accepted (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Token required in purge requests (optional)
    pub auth_token: Option<String>,
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_device_name() -> String {
    "device".to_string()
}

fn default_static_name() -> String {
    "static".to_string()
}

fn default_cookie_name() -> String {
    "X-UA-map".to_string()
}

fn default_delimiter() -> String {
    "#".to_string()
}

fn default_memcached_host() -> String {
    "localhost".to_string()
}

fn default_memcached_port() -> u16 {
    DEFAULT_PORT
}

fn default_attribute() -> String {
    "tier".to_string()
}

impl Default for BouncerConfig {
    fn default() -> Self {
        BouncerConfig {
            listen_address: default_listen_address(),
            handlers: vec![HandlerConfig::Device(DeviceHandlerConfig::default())],
            classifier: ClassifierConfig::default(),
            admin: AdminConfig::default(),
            metrics_enabled: default_true(),
        }
    }
}

impl Default for DeviceHandlerConfig {
    fn default() -> Self {
        DeviceHandlerConfig {
            name: default_device_name(),
            cookie_name: default_cookie_name(),
            cache_key_prefix: String::new(),
            cache_key_delimiter: default_delimiter(),
            cache_entry_ttl: 0,
            debug_path: None,
            cache_backend: CacheBackendKind::default(),
            memcached: MemcachedConfig::default(),
            handling: HandlingConfig::default(),
        }
    }
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            host: default_memcached_host(),
            port: default_memcached_port(),
        }
    }
}

impl Default for HandlingConfig {
    fn default() -> Self {
        HandlingConfig::Cookie {
            attribute: default_attribute(),
        }
    }
}

impl ClassifierConfig {
    /// Configured rules, or the built-in ones when none are configured
    pub fn effective_rules(&self) -> Vec<DeviceRule> {
        if self.rules.is_empty() {
            default_rules()
        } else {
            self.rules.clone()
        }
    }
}

impl BouncerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(BouncerConfig)` if loading and validation succeed
    /// * `Err(BouncerError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            BouncerError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: BouncerConfig = serde_yaml::from_str(content).map_err(|e| {
            BouncerError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - at least one handler must be configured
    /// - listen_address must be a socket address
    /// - every device handler must itself be valid
    /// - a purge token, if set, must not be empty
    pub fn validate(&self) -> Result<()> {
        if self.handlers.is_empty() {
            return Err(BouncerError::ConfigError(
                "at least one handler must be configured".to_string(),
            ));
        }

        self.listen_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                BouncerError::ConfigError(format!(
                    "invalid listen_address '{}': {}",
                    self.listen_address, e
                ))
            })?;

        for handler in &self.handlers {
            if let HandlerConfig::Device(device) = handler {
                device.validate()?;
            }
        }

        if let Some(token) = &self.admin.auth_token {
            if token.is_empty() {
                return Err(BouncerError::ConfigError(
                    "admin auth_token must not be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl DeviceHandlerConfig {
    /// Validate a device handler configuration
    ///
    /// # Validation Rules
    /// - cache_key_delimiter must not be empty
    /// - prefix and delimiter must be usable in memcached keys
    /// - memcached port must be non-zero
    /// - cache_entry_ttl must not exceed 30 days (memcached reads larger
    ///   values as absolute timestamps)
    /// - debug_path, if set, must start with '/'
    /// - template handling needs a non-empty template
    pub fn validate(&self) -> Result<()> {
        if self.cache_key_delimiter.is_empty() {
            return Err(BouncerError::ConfigError(format!(
                "handler '{}': cache_key_delimiter must not be empty",
                self.name
            )));
        }

        let invalid_key_char = |c: char| c.is_whitespace() || c.is_control();
        if self.cache_key_prefix.chars().any(invalid_key_char)
            || self.cache_key_delimiter.chars().any(invalid_key_char)
        {
            return Err(BouncerError::ConfigError(format!(
                "handler '{}': cache key prefix and delimiter must not contain whitespace",
                self.name
            )));
        }

        if self.cookie_name.is_empty() {
            return Err(BouncerError::ConfigError(format!(
                "handler '{}': cookie_name must not be empty",
                self.name
            )));
        }

        if self.cache_backend == CacheBackendKind::Memcached && self.memcached.port == 0 {
            return Err(BouncerError::ConfigError(format!(
                "handler '{}': memcached port must be greater than 0",
                self.name
            )));
        }

        if self.cache_entry_ttl > MAX_RELATIVE_EXPIRY {
            return Err(BouncerError::ConfigError(format!(
                "handler '{}': cache_entry_ttl must be at most {} seconds, got {}",
                self.name, MAX_RELATIVE_EXPIRY, self.cache_entry_ttl
            )));
        }

        if let Some(path) = &self.debug_path {
            if !path.starts_with('/') {
                return Err(BouncerError::ConfigError(format!(
                    "handler '{}': debug_path must start with '/', got {}",
                    self.name, path
                )));
            }
        }

        if let HandlingConfig::Template { template } = &self.handling {
            if template.is_empty() {
                return Err(BouncerError::ConfigError(format!(
                    "handler '{}': template handling requires a template",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BouncerConfig::default();
        assert_eq!(config.listen_address, "127.0.0.1:8080");
        assert!(config.metrics_enabled);
        assert!(!config.admin.enabled);
        assert!(config.validate().is_ok());

        let HandlerConfig::Device(device) = &config.handlers[0] else {
            panic!("expected a device handler");
        };
        assert_eq!(device.cookie_name, "X-UA-map");
        assert_eq!(device.cache_key_prefix, "");
        assert_eq!(device.cache_key_delimiter, "#");
        assert_eq!(device.cache_entry_ttl, 0);
        assert_eq!(device.memcached.port, 11211);
    }

    #[test]
    fn test_parse_pipeline() {
        let yaml = r#"
listen_address: "0.0.0.0:9000"
handlers:
  - type: static
    headers:
      X-Served-By: bouncer
  - type: device
    name: ua-map
    cookie_name: X-UA-header
    cache_key_prefix: prefix
    cache_key_delimiter: "_"
    cache_entry_ttl: 100
    debug_path: /_debug
    memcached:
      host: cache.internal
    handling:
      kind: headers
"#;
        let config = BouncerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.handlers.len(), 2);

        let HandlerConfig::Device(device) = &config.handlers[1] else {
            panic!("expected a device handler");
        };
        assert_eq!(device.name, "ua-map");
        assert_eq!(device.cache_key_prefix, "prefix");
        assert_eq!(device.cache_key_delimiter, "_");
        assert_eq!(device.cache_entry_ttl, 100);
        assert_eq!(device.debug_path.as_deref(), Some("/_debug"));
        assert_eq!(device.memcached.host, "cache.internal");
        assert_eq!(device.memcached.port, 11211);
        assert_eq!(device.handling, HandlingConfig::Headers);
    }

    #[test]
    fn test_legacy_key_names_and_unknown_keys() {
        let yaml = r#"
handlers:
  - type: device
    cache_prefix: legacy
    cache_prefix_delimiter: "-"
    cache_lifetime: 30
    some_future_option: true
"#;
        let config = BouncerConfig::from_yaml(yaml).unwrap();
        let HandlerConfig::Device(device) = &config.handlers[0] else {
            panic!("expected a device handler");
        };
        assert_eq!(device.cache_key_prefix, "legacy");
        assert_eq!(device.cache_key_delimiter, "-");
        assert_eq!(device.cache_entry_ttl, 30);
    }

    #[test]
    fn test_validate_empty_pipeline() {
        let config = BouncerConfig {
            handlers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_listen_address() {
        let config = BouncerConfig {
            listen_address: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_device_handler() {
        let mut device = DeviceHandlerConfig::default();
        device.cache_key_delimiter = String::new();
        assert!(device.validate().is_err());

        let mut device = DeviceHandlerConfig::default();
        device.cache_key_prefix = "has space".to_string();
        assert!(device.validate().is_err());

        let mut device = DeviceHandlerConfig::default();
        device.debug_path = Some("_debug".to_string());
        assert!(device.validate().is_err());

        let mut device = DeviceHandlerConfig::default();
        device.memcached.port = 0;
        assert!(device.validate().is_err());
        device.cache_backend = CacheBackendKind::Memory;
        assert!(device.validate().is_ok());

        let mut device = DeviceHandlerConfig::default();
        device.handling = HandlingConfig::Template {
            template: String::new(),
        };
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_validate_cache_entry_ttl_limit() {
        let mut device = DeviceHandlerConfig::default();
        device.cache_entry_ttl = MAX_RELATIVE_EXPIRY;
        assert!(device.validate().is_ok());

        // 60 days would be read by memcached as a timestamp in 1970
        device.cache_entry_ttl = 60 * 60 * 24 * 60;
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_effective_rules() {
        assert_eq!(ClassifierConfig::default().effective_rules(), default_rules());
    }
}
