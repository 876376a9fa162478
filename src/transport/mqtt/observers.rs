//! Connection lifecycle observers
//!
//! Observers are passed to [`ConnectionManager`](super::ConnectionManager) instead of
//! living in shared globals, so independent sessions can log or react differently.
//! The defaults only emit `tracing` events.

use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Callback receiving `(topic, payload)` for a delivered message
pub type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Callback fired once the broker acknowledges the connection
pub type ConnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback fired with the failure reason when an established connection drops
pub type ConnectionLostCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The three passive observers attached to every session
#[derive(Clone)]
pub struct ConnectionObservers {
    /// Inbound messages that match no subscription
    pub on_unmatched_message: MessageCallback,
    /// Connection acknowledged, receives the broker URL
    pub on_connect: ConnectCallback,
    /// Established connection lost, receives the reason
    pub on_connection_lost: ConnectionLostCallback,
}

impl ConnectionObservers {
    pub fn with_unmatched_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.on_unmatched_message = Arc::new(callback);
        self
    }

    pub fn with_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_connect = Arc::new(callback);
        self
    }

    pub fn with_connection_lost<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_connection_lost = Arc::new(callback);
        self
    }
}

impl Default for ConnectionObservers {
    fn default() -> Self {
        Self {
            on_unmatched_message: Arc::new(|topic: &str, payload: &str| {
                info!(topic = %topic, payload = %payload, "Received message");
            }),
            on_connect: Arc::new(|broker_url: &str| {
                info!(broker = %broker_url, "Connected");
            }),
            on_connection_lost: Arc::new(|reason: &str| {
                warn!(reason = %reason, "Connection lost");
            }),
        }
    }
}

impl fmt::Debug for ConnectionObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionObservers").finish_non_exhaustive()
    }
}
