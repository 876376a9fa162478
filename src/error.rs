//! Error types for the MQTT event bus
//!
//! Every failure surfaces as a typed error returned to the caller. Nothing in this
//! crate terminates the host process.

use crate::config::ConfigError;
use crate::transport::mqtt::ConnectionState;
use rumqttc::tokio_rustls::rustls;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Trust material could not be assembled from the configured files
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("TLS is enabled but no {0} is configured")]
    MissingPath(&'static str),

    #[error("Failed to read {kind} from {path}")]
    Read {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse PEM data in {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No PEM certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("No PEM private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("CA certificate from {path} was rejected")]
    InvalidCaCertificate {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("Client certificate and key do not form a usable identity")]
    InvalidClientIdentity(#[source] rustls::Error),
}

/// A session could not be established
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid connection configuration")]
    InvalidConfig(#[from] ConfigError),

    #[error("TLS configuration error")]
    TlsConfig(#[from] TlsConfigError),

    #[error("Connection to {broker_url} failed")]
    Failed {
        broker_url: String,
        #[source]
        source: rumqttc::ConnectionError,
    },

    #[error("No connection acknowledgement from {broker_url} within {timeout:?}")]
    Timeout {
        broker_url: String,
        timeout: Duration,
    },

    #[error("Event loop for {broker_url} stopped before the connection was acknowledged")]
    EventLoopStopped { broker_url: String },
}

/// A publish was rejected or could not be handed to the network
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publish topic must not be empty")]
    EmptyTopic,

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Publish request to '{topic}' failed")]
    Request {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    #[error("Publish to '{topic}' was not handed to the network within {timeout:?}")]
    HandOffTimeout { topic: String, timeout: Duration },
}

/// A subscription was rejected or ended before it became active
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubscribeError {
    #[error("Subscription topic filter must not be empty")]
    EmptyTopic,

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Subscribe request for '{topic}' failed: {reason}")]
    Request { topic: String, reason: String },

    #[error("Broker rejected subscription to '{topic}'")]
    Rejected { topic: String },

    #[error("Subscription to '{topic}' ended before it was acknowledged")]
    Cancelled { topic: String },
}

/// Crate-level error aggregating every operation's failure type
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Subscribe error: {0}")]
    Subscribe(#[from] SubscribeError),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

pub type EventBusResult<T> = Result<T, EventBusError>;

impl ConnectionError {
    /// Whether the failure came from assembling TLS trust material
    pub fn is_tls_config(&self) -> bool {
        matches!(self, ConnectionError::TlsConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_tls_error_converts_into_connection_error() {
        let tls = TlsConfigError::MissingPath("ca_file");
        let err: ConnectionError = tls.into();
        assert!(err.is_tls_config());
        assert!(err.source().is_some());
    }

    #[test]
    fn test_read_error_keeps_io_source() {
        let err = TlsConfigError::Read {
            kind: "CA certificate",
            path: PathBuf::from("/missing/ca.pem"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("/missing/ca.pem"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_display() {
        let errors: Vec<EventBusError> = vec![
            PublishError::EmptyTopic.into(),
            PublishError::NotConnected {
                state: ConnectionState::Closed,
            }
            .into(),
            SubscribeError::Rejected {
                topic: "t1".to_string(),
            }
            .into(),
            ConnectionError::Timeout {
                broker_url: "tcp://localhost:1883".to_string(),
                timeout: Duration::from_secs(1),
            }
            .into(),
            ConfigError::InvalidHost("".to_string()).into(),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
