//! Mock implementations for testing
//!
//! Provides an in-memory [`Transport`] so code built on the event bus can be tested
//! without an MQTT broker.

use crate::error::{PublishError, SubscribeError};
use crate::topics::{routing_filter, topic_matches};
use crate::transport::mqtt::{
    ConnectionState, MessageCallback, SubscriptionHandle, SubscriptionStatus,
};
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

pub type PublishedMessage = (String, Vec<u8>);

struct MockSubscription {
    filter: String,
    callback: MessageCallback,
    token: CancellationToken,
    _status: watch::Sender<SubscriptionStatus>,
}

/// Mock transport for testing
///
/// Publishes are recorded and looped back to matching local subscriptions, the way a
/// broker would deliver them to a client subscribed to its own topics.
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub should_fail: bool,
    subscriptions: Arc<Mutex<Vec<MockSubscription>>>,
    state: watch::Sender<ConnectionState>,
    next_id: AtomicU64,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            published_messages: Arc::default(),
            should_fail: false,
            subscriptions: Arc::default(),
            state: watch::channel(ConnectionState::Connected).0,
            next_id: AtomicU64::new(1),
        }
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("should_fail", &self.should_fail)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
    }

    /// Number of subscriptions that have not been cancelled
    pub async fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .iter()
            .filter(|s| !s.token.is_cancelled())
            .count()
    }

    /// Simulate the broker dropping the connection
    pub fn simulate_connection_lost(&self, reason: &str) {
        self.state
            .send_replace(ConnectionState::ConnectionLost(reason.to_string()));
    }

    /// Deliver a message as if it arrived from the broker.
    ///
    /// Returns the number of callbacks invoked.
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        if !self.current_state().is_connected() {
            return 0;
        }

        let callbacks: Vec<MessageCallback> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.retain(|s| !s.token.is_cancelled());
            subscriptions
                .iter()
                .filter(|s| topic_matches(routing_filter(&s.filter), topic))
                .map(|s| s.callback.clone())
                .collect()
        };

        let text = String::from_utf8_lossy(payload);
        for callback in &callbacks {
            callback(topic, &text);
        }
        callbacks.len()
    }

    fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if topic.is_empty() {
            return Err(PublishError::EmptyTopic);
        }
        if self.should_fail {
            return Err(PublishError::NotConnected {
                state: ConnectionState::ConnectionLost("Mock publish failure".to_string()),
            });
        }
        let state = self.current_state();
        if !state.is_connected() {
            return Err(PublishError::NotConnected { state });
        }

        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload.clone()));
        self.inject(topic, &payload).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        if topic.is_empty() {
            return Err(SubscribeError::EmptyTopic);
        }
        if self.should_fail {
            return Err(SubscribeError::Request {
                topic: topic.to_string(),
                reason: "Mock subscribe failure".to_string(),
            });
        }
        let state = self.current_state();
        if !state.is_connected() {
            return Err(SubscribeError::NotConnected { state });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (status_tx, status_rx) =
            watch::channel(SubscriptionStatus::Active(QoS::AtLeastOnce));

        self.subscriptions.lock().await.push(MockSubscription {
            filter: topic.to_string(),
            callback,
            token: token.clone(),
            _status: status_tx,
        });

        Ok(SubscriptionHandle::new(id, topic, token, status_rx))
    }

    async fn close(&self) {
        self.state.send_replace(ConnectionState::Closed);
        let mut subscriptions = self.subscriptions.lock().await;
        for subscription in subscriptions.iter() {
            subscription.token.cancel();
        }
        subscriptions.clear();
    }

    fn is_connected(&self) -> bool {
        !self.should_fail && self.state.borrow().is_connected()
    }

    fn connection_state(&self) -> ConnectionState {
        if self.should_fail {
            ConnectionState::ConnectionLost("Mock disconnection".to_string())
        } else {
            self.current_state()
        }
    }
}
