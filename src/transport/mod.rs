//! Transport layer for the event bus
//!
//! This module provides the transport abstraction and its MQTT implementation.

use crate::error::{PublishError, SubscribeError};
use crate::transport::mqtt::{ConnectionState, MessageCallback, SubscriptionHandle};

pub mod mqtt;

/// Publish/subscribe transport
///
/// This trait abstracts the broker session so callers can be tested against
/// [`MockTransport`](crate::testing::MockTransport).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload to a topic, returning once it has been handed to the network
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// Register a callback for every message matching a topic filter
    async fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, SubscribeError>;

    /// Disconnect and stop all subscriptions
    async fn close(&self);

    fn is_connected(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::Session;
