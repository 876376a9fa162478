//! Configuration loading and validation tests
//!
//! Tests focus on behavior of loading a `ConnectionConfig` from TOML: defaults,
//! validation failures and the derived connection values.

use mqtt_eventbus::config::{ConfigError, ConnectionConfig, Scheme};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

fn config_file(contents: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{contents}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_with_defaults() {
    let file = config_file(r#"host = "broker.local""#);
    let config = ConnectionConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.host, "broker.local");
    assert_eq!(config.port, 1883);
    assert!(!config.use_tls);
    assert_eq!(config.scheme(), Scheme::Tcp);
    assert_eq!(config.broker_url(), "tcp://broker.local:1883");
    assert_eq!(config.keep_alive(), Duration::from_secs(30));
    assert_eq!(config.min_publish_interval(), Duration::from_millis(200));
    assert_eq!(config.close_grace(), Duration::from_millis(250));
    assert_eq!(config.credentials(), None);
}

#[test]
fn test_config_loads_tls_settings() {
    let file = config_file(
        r#"
host = "10.0.0.12"
port = 8883
client_id = "gateway-1"
username = "gateway"
password = "secret"
use_tls = true
ca_file = "/etc/eventbus/ca.pem"
crt_file = "/etc/eventbus/client.crt"
key_file = "/etc/eventbus/client.key"
min_publish_interval_ms = 0
"#,
    );
    let config = ConnectionConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.scheme(), Scheme::Ssl);
    assert_eq!(config.broker_url(), "ssl://10.0.0.12:8883");
    assert_eq!(config.effective_client_id(), "gateway-1");
    assert_eq!(config.ca_file, Some(PathBuf::from("/etc/eventbus/ca.pem")));
    assert_eq!(
        config.credentials(),
        Some(("gateway".to_string(), "secret".to_string()))
    );
    assert!(config.min_publish_interval().is_zero());
    assert!(!config.insecure_skip_verify);
}

#[test]
fn test_config_debug_redacts_password() {
    let file = config_file(
        r#"
host = "localhost"
username = "user"
password = "hunter2"
"#,
    );
    let config = ConnectionConfig::load_from_file(file.path()).unwrap();
    let debug = format!("{config:?}");

    assert!(debug.contains("user"));
    assert!(!debug.contains("hunter2"));
}

#[test]
fn test_config_returns_error_when_host_missing() {
    let file = config_file("port = 1883");
    let result = ConnectionConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_invalid_host() {
    let file = config_file(r#"host = "not a host""#);
    let result = ConnectionConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidHost(_))));
}

#[test]
fn test_config_returns_error_for_zero_port() {
    let file = config_file(
        r#"
host = "localhost"
port = 0
"#,
    );
    let result = ConnectionConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_returns_error_for_invalid_toml_syntax() {
    let file = config_file("host = [unterminated");
    let result = ConnectionConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_missing_file() {
    let result = ConnectionConfig::load_from_file(std::path::Path::new(
        "/nonexistent/eventbus/eventbus.toml",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_returns_error_for_client_id_with_leading_space() {
    let file = config_file(
        r#"
host = "localhost"
client_id = " gateway"
"#,
    );
    let result = ConnectionConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidClientId(_))));
}

#[test]
fn test_config_env_overrides_credentials() {
    let file = config_file(
        r#"
host = "localhost"
username = "from-file"
password = "from-file"
username_env = "EVENTBUS_TEST_CONFIG_LOADING_USER"
password_env = "EVENTBUS_TEST_CONFIG_LOADING_PASS"
"#,
    );
    let config = ConnectionConfig::load_from_file(file.path()).unwrap();

    std::env::set_var("EVENTBUS_TEST_CONFIG_LOADING_USER", "from-env");
    std::env::set_var("EVENTBUS_TEST_CONFIG_LOADING_PASS", "env-secret");
    assert_eq!(
        config.credentials(),
        Some(("from-env".to_string(), "env-secret".to_string()))
    );
    std::env::remove_var("EVENTBUS_TEST_CONFIG_LOADING_USER");
    std::env::remove_var("EVENTBUS_TEST_CONFIG_LOADING_PASS");
}

#[test]
fn test_generated_client_ids_are_unique() {
    let config = ConnectionConfig::new("localhost", 1883);
    let first = config.effective_client_id();
    let second = config.effective_client_id();

    assert!(first.starts_with("eventbus-"));
    assert_ne!(first, second);
}
