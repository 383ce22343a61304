use std::io::Write;
use ua_bouncer::config::{BouncerConfig, CacheBackendKind, HandlerConfig, HandlingConfig};

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_sample_config() {
    let config = BouncerConfig::from_file("ua_bouncer.yaml");
    assert!(config.is_ok(), "Failed to load sample config: {:?}", config.err());

    let config = config.unwrap();
    assert_eq!(config.handlers.len(), 2);
    assert!(config.admin.enabled);
    assert_eq!(config.classifier.rules.len(), 3);

    match &config.handlers[1] {
        HandlerConfig::Device(device) => {
            assert_eq!(device.name, "ua-map");
            assert_eq!(device.cache_key_prefix, "uamap");
            assert_eq!(device.cache_entry_ttl, 3600);
            assert_eq!(device.debug_path.as_deref(), Some("/_debug"));
        }
        other => panic!("expected device handler, got {:?}", other),
    }
}

#[test]
fn test_load_minimal_config() {
    let file = write_config(
        r#"
handlers:
  - type: device
"#,
    );

    let config = BouncerConfig::from_file(file.path()).unwrap();
    assert_eq!(config.listen_address, "127.0.0.1:8080");
    assert!(config.metrics_enabled);
    assert!(!config.admin.enabled);

    // Check defaults are applied
    let HandlerConfig::Device(device) = &config.handlers[0] else {
        panic!("expected device handler");
    };
    assert_eq!(device.name, "device");
    assert_eq!(device.cookie_name, "X-UA-map");
    assert_eq!(device.cache_key_prefix, "");
    assert_eq!(device.cache_key_delimiter, "#");
    assert_eq!(device.cache_entry_ttl, 0);
    assert_eq!(device.cache_backend, CacheBackendKind::Memcached);
    assert_eq!(device.memcached.host, "localhost");
    assert_eq!(device.memcached.port, 11211);
    assert_eq!(
        device.handling,
        HandlingConfig::Cookie {
            attribute: "tier".to_string()
        }
    );
}

#[test]
fn test_legacy_option_names() {
    let file = write_config(
        r#"
handlers:
  - type: device
    cookie_name: X-UA-header
    cache_prefix: prefix
    cache_prefix_delimiter: "_"
    cache_lifetime: 100
    debug_path: /_debug
"#,
    );

    let config = BouncerConfig::from_file(file.path()).unwrap();
    let HandlerConfig::Device(device) = &config.handlers[0] else {
        panic!("expected device handler");
    };
    assert_eq!(device.cache_key_prefix, "prefix");
    assert_eq!(device.cache_key_delimiter, "_");
    assert_eq!(device.cache_entry_ttl, 100);
}

#[test]
fn test_load_invalid_config() {
    let file = write_config(
        r#"
handlers:
  - type: device
    cache_key_delimiter: ""
"#,
    );

    let config = BouncerConfig::from_file(file.path());
    assert!(config.is_err(), "Should fail validation for an empty delimiter");
}

#[test]
fn test_load_config_with_ttl_beyond_30_days() {
    let file = write_config(
        r#"
handlers:
  - type: device
    cache_entry_ttl: 5184000
"#,
    );

    let config = BouncerConfig::from_file(file.path());
    assert!(config.is_err(), "Should reject lifetimes memcached reads as timestamps");
}

#[test]
fn test_load_config_without_handlers() {
    let file = write_config("listen_address: \"127.0.0.1:9000\"\n");
    assert!(BouncerConfig::from_file(file.path()).is_err());
}

#[test]
fn test_load_nonexistent_file() {
    let config = BouncerConfig::from_file("nonexistent.yaml");
    assert!(config.is_err(), "Should fail when file doesn't exist");
}
