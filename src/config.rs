//! Connection configuration for the MQTT event bus
//!
//! A [`ConnectionConfig`] is built once by the caller (in code or from a TOML file) and
//! never mutated by the crate. Paths to TLS material are only consulted when
//! `use_tls` is enabled.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Transport scheme selected for the broker URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP
    Tcp,
    /// TLS over TCP
    Ssl,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker connection settings
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Broker host name or IP address
    pub host: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// MQTT client identifier (generated when empty)
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Environment variable overriding `username` at connect time
    #[serde(default)]
    pub username_env: Option<String>,
    /// Environment variable overriding `password` at connect time
    #[serde(default)]
    pub password_env: Option<String>,
    /// Connect with mutual TLS (`ssl://` scheme)
    #[serde(default)]
    pub use_tls: bool,
    /// PEM file holding the CA certificates to trust
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// PEM file holding the client certificate chain
    #[serde(default)]
    pub crt_file: Option<PathBuf>,
    /// PEM file holding the client private key
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Accept any server certificate.
    ///
    /// Disables server identity verification while still presenting the client
    /// identity. Only meant for brokers with self-issued certificates on trusted
    /// networks; every connection made with this flag logs a warning.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// MQTT keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Upper bound on waiting for the broker's CONNACK
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound on waiting for a publish to be handed to the network
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    /// Minimum interval between consecutive publishes (0 disables pacing)
    #[serde(default = "default_min_publish_interval_ms")]
    pub min_publish_interval_ms: u64,
    /// Grace period granted to in-flight work when closing a session
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_publish_timeout_secs() -> u64 {
    30
}

fn default_min_publish_interval_ms() -> u64 {
    200
}

fn default_close_grace_ms() -> u64 {
    250
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker host '{0}'")]
    InvalidHost(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectionConfig {
    /// Create a plain TCP configuration with defaults for everything else
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            username_env: None,
            password_env: None,
            use_tls: false,
            ca_file: None,
            crt_file: None,
            key_file: None,
            insecure_skip_verify: false,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            min_publish_interval_ms: default_min_publish_interval_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Enable mutual TLS with the given CA, client certificate and client key files
    pub fn with_tls(
        mut self,
        ca_file: impl Into<PathBuf>,
        crt_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        self.use_tls = true;
        self.ca_file = Some(ca_file.into());
        self.crt_file = Some(crt_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_min_publish_interval(mut self, interval: Duration) -> Self {
        self.min_publish_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConnectionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values that would otherwise only fail once connecting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() || url::Host::parse(&self.host).is_err() {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "port must be greater than 0".to_string(),
            ));
        }

        if self.client_id.starts_with(char::is_whitespace) {
            return Err(ConfigError::InvalidClientId(format!(
                "'{}' must not start with whitespace",
                self.client_id
            )));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.publish_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// `ssl` when TLS is enabled, `tcp` otherwise
    pub fn scheme(&self) -> Scheme {
        if self.use_tls {
            Scheme::Ssl
        } else {
            Scheme::Tcp
        }
    }

    /// Broker URL in `scheme://host:port` form
    pub fn broker_url(&self) -> String {
        format!("{}://{}:{}", self.scheme(), self.host, self.port)
    }

    /// Client identifier to present, generating one when none is configured
    pub fn effective_client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!("eventbus-{}", uuid::Uuid::new_v4().simple())
        } else {
            self.client_id.clone()
        }
    }

    /// Credentials to present, with environment overrides applied.
    ///
    /// Returns `None` when no username is configured.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = Self::get_env_var_optional(self.username_env.as_ref())
            .unwrap_or_else(|| self.username.clone());
        if username.is_empty() {
            return None;
        }

        let password = Self::get_env_var_optional(self.password_env.as_ref())
            .unwrap_or_else(|| self.password.clone());
        Some((username, password))
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn min_publish_interval(&self) -> Duration {
        Duration::from_millis(self.min_publish_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

// Hand-written so passwords never reach the logs
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("username_env", &self.username_env)
            .field("password_env", &self.password_env)
            .field("use_tls", &self.use_tls)
            .field("ca_file", &self.ca_file)
            .field("crt_file", &self.crt_file)
            .field("key_file", &self.key_file)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("publish_timeout_secs", &self.publish_timeout_secs)
            .field("min_publish_interval_ms", &self.min_publish_interval_ms)
            .field("close_grace_ms", &self.close_grace_ms)
            .finish()
    }
}
