//! Per-subscription delivery tasks and their handles
//!
//! Every subscribe call spawns one [`DeliveryTask`]. It waits for the broker's SUBACK,
//! then feeds each matching message to the user callback until the subscription is
//! cancelled or the session closes.

use super::message_handler::{InboundMessage, SubscriptionAck, SubscriptionRegistry};
use super::observers::MessageCallback;
use crate::error::SubscribeError;
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a single subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionStatus {
    /// SUBSCRIBE queued, waiting for the SUBACK
    Pending,
    /// Broker granted the subscription at this QoS
    Active(QoS),
    /// Subscription never became active
    Failed(SubscribeError),
    /// Delivery stopped by cancellation or session close
    Ended,
}

/// Handle to a live subscription.
///
/// Dropping the handle does not cancel the subscription; it stays active until
/// [`cancel`](Self::cancel) is called or the session closes.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
    token: CancellationToken,
    status: watch::Receiver<SubscriptionStatus>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: u64,
        topic: impl Into<String>,
        token: CancellationToken,
        status: watch::Receiver<SubscriptionStatus>,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            token,
            status,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Topic filter this subscription was made with
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    /// Wait for the broker's answer to the subscribe request.
    ///
    /// Resolves to the granted QoS, or the reason the subscription never became active.
    pub async fn acknowledged(&self) -> Result<QoS, SubscribeError> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| !matches!(s, SubscriptionStatus::Pending))
            .await
            .map(|s| s.clone());

        match settled {
            Ok(SubscriptionStatus::Active(qos)) => Ok(qos),
            Ok(SubscriptionStatus::Failed(err)) => Err(err),
            _ => Err(SubscribeError::Cancelled {
                topic: self.topic.clone(),
            }),
        }
    }

    /// Stop delivery and unsubscribe this filter from the broker
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Background task owning one subscription's callback
pub(crate) struct DeliveryTask {
    pub id: u64,
    pub topic: String,
    pub callback: MessageCallback,
    pub ack: oneshot::Receiver<SubscriptionAck>,
    pub messages: mpsc::Receiver<InboundMessage>,
    pub token: CancellationToken,
    pub session_token: CancellationToken,
    pub status: watch::Sender<SubscriptionStatus>,
    pub registry: Arc<Mutex<SubscriptionRegistry>>,
    pub client: AsyncClient,
}

impl DeliveryTask {
    pub async fn run(mut self) {
        let ack = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            ack = &mut self.ack => Some(ack),
        };

        match ack {
            Some(Ok(SubscriptionAck::Granted(qos))) => {
                info!(topic = %self.topic, qos = ?qos, "Subscribed");
                self.status.send_replace(SubscriptionStatus::Active(qos));
            }
            Some(Ok(SubscriptionAck::Rejected)) => {
                error!(topic = %self.topic, "Broker rejected subscription");
                self.status
                    .send_replace(SubscriptionStatus::Failed(SubscribeError::Rejected {
                        topic: self.topic.clone(),
                    }));
                self.finish(false).await;
                return;
            }
            Some(Err(_)) => {
                warn!(topic = %self.topic, "Subscription ended before it was acknowledged");
                self.status
                    .send_replace(SubscriptionStatus::Failed(SubscribeError::Cancelled {
                        topic: self.topic.clone(),
                    }));
                self.finish(false).await;
                return;
            }
            None => {
                self.status
                    .send_replace(SubscriptionStatus::Failed(SubscribeError::Cancelled {
                        topic: self.topic.clone(),
                    }));
                self.finish(true).await;
                return;
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                message = self.messages.recv() => match message {
                    Some(message) => (self.callback)(&message.topic, &message.payload_text()),
                    None => break,
                },
            }
        }

        self.status.send_replace(SubscriptionStatus::Ended);
        self.finish(true).await;
    }

    /// Drop the route and, when only this subscription was cancelled, tell the broker
    async fn finish(&self, unsubscribe: bool) {
        let still_used = {
            let mut registry = self.registry.lock().await;
            registry.unregister(self.id);
            registry.has_filter(&self.topic)
        };

        if !unsubscribe || still_used || self.session_token.is_cancelled() {
            debug!(topic = %self.topic, "Delivery task stopped");
            return;
        }

        match self.client.unsubscribe(self.topic.clone()).await {
            Ok(()) => info!(topic = %self.topic, "Unsubscribed"),
            Err(e) => warn!(topic = %self.topic, error = %e, "Failed to unsubscribe"),
        }
    }
}
