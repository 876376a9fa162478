//! Pure connection state management for the MQTT session
//!
//! This module contains the session state model, the publish pacing policy and the
//! mapping from [`ConnectionConfig`] to `rumqttc` options.

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::transport::mqtt::tls;
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Connection state for an MQTT session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Waiting for the broker's CONNACK
    Connecting,
    /// Acknowledged by the broker, ready for publish and subscribe
    Connected,
    /// An established connection dropped; no reconnection is attempted
    ConnectionLost(String),
    /// Closed by the caller
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether the session can never become usable again
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectionLost(_) | ConnectionState::Closed
        )
    }
}

/// Minimum inter-publish interval applied after every hand-off.
///
/// Publishes are serialized, so the interval paces concurrent publishers as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPacing {
    pub min_interval: Duration,
}

impl PublishPacing {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    /// No pacing at all
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        !self.min_interval.is_zero()
    }

    /// Wait out the settling period
    pub async fn settle(&self) {
        if self.is_enabled() {
            tokio::time::sleep(self.min_interval).await;
        }
    }
}

impl Default for PublishPacing {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

impl From<&ConnectionConfig> for PublishPacing {
    fn from(config: &ConnectionConfig) -> Self {
        Self::new(config.min_publish_interval())
    }
}

/// Hand-off tickets for the publishes issued on one client.
///
/// The event loop counts every outgoing PUBLISH it writes. Requests are written in the
/// order they were queued, so the n-th publish issued is handed off once the count
/// reaches n. A publish that timed out still owns its ticket, and its late hand-off
/// can never satisfy a later publish.
#[derive(Debug, Default)]
pub struct HandOffSequence {
    issued: u64,
}

impl HandOffSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the ticket for a publish that was just queued on the client
    pub fn issue(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Wait until the publish holding `ticket` has been handed off.
    ///
    /// Returns false if the event loop stopped first.
    pub async fn handed_off(handoffs: &mut watch::Receiver<u64>, ticket: u64) -> bool {
        handoffs.wait_for(|count| *count >= ticket).await.is_ok()
    }
}

/// Pure function to configure `rumqttc` options from a connection config.
///
/// Validates the config, applies credentials and, when TLS is enabled, loads the
/// trust material. TLS problems surface as [`ConnectionError::TlsConfig`].
pub fn configure_mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, ConnectionError> {
    config.validate()?;

    let mut mqtt_options =
        MqttOptions::new(config.effective_client_id(), config.host.clone(), config.port);
    mqtt_options.set_keep_alive(config.keep_alive());
    mqtt_options.set_clean_session(true);

    if let Some((username, password)) = config.credentials() {
        mqtt_options.set_credentials(username, password);
    }

    if config.use_tls {
        let client_config = tls::client_config_from_config(config)?;
        let transport =
            RumqttcTransport::tls_with_config(TlsConfiguration::Rustls(Arc::new(client_config)));
        mqtt_options.set_transport(transport);
    }

    Ok(mqtt_options)
}
