//! Impure I/O operations for the MQTT session
//!
//! [`ConnectionManager`] opens sessions. Each [`Session`] owns one `rumqttc` client and a
//! background task that drives its event loop, routes inbound messages to subscriptions
//! and tracks the connection state.

use super::connection::{
    configure_mqtt_options, ConnectionState, HandOffSequence, PublishPacing,
};
use super::message_handler::{
    EventRoute, InboundMessage, MessageHandler, SubAckTracker, SubscriptionRegistry,
    DELIVERY_QUEUE_CAPACITY,
};
use super::observers::{ConnectionObservers, MessageCallback};
use super::subscription::{DeliveryTask, SubscriptionHandle, SubscriptionStatus};
use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, PublishError, SubscribeError};
use crate::mqtt_span;
use crate::topics::is_wildcard_filter;
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the request channel between client handles and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Opens MQTT sessions with a shared set of connection observers
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    observers: ConnectionObservers,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observers(observers: ConnectionObservers) -> Self {
        Self { observers }
    }

    pub fn observers(&self) -> &ConnectionObservers {
        &self.observers
    }

    /// Connect to the broker described by `config`.
    ///
    /// Returns only once the broker has acknowledged the connection. A refused or failed
    /// attempt, or no CONNACK within the connect timeout, is returned as an error and
    /// leaves nothing running.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Session, ConnectionError> {
        let broker_url = config.broker_url();
        let span = mqtt_span!(operation = "connect", broker = %broker_url);
        self.connect_inner(config, broker_url).instrument(span).await
    }

    async fn connect_inner(
        &self,
        config: &ConnectionConfig,
        broker_url: String,
    ) -> Result<Session, ConnectionError> {
        let mqtt_options = configure_mqtt_options(config)?;
        let client_id = mqtt_options.client_id();
        info!(client_id = %client_id, "Connecting to MQTT broker");

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (handoff_tx, handoff_rx) = watch::channel(0u64);
        let (connack_tx, connack_rx) = oneshot::channel();
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let subacks = Arc::new(Mutex::new(SubAckTracker::new()));
        let shutdown = CancellationToken::new();

        let supervisor = EventLoopSupervisor {
            broker_url: broker_url.clone(),
            event_loop,
            state_tx: state_tx.clone(),
            handoff_tx,
            connack_tx: Some(connack_tx),
            registry: registry.clone(),
            subacks: subacks.clone(),
            observers: self.observers.clone(),
            shutdown: shutdown.clone(),
        };
        let mut handle = tokio::spawn(supervisor.run().in_current_span());

        let timeout = config.connect_timeout();
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(source))) => {
                shutdown.cancel();
                let _ = (&mut handle).await;
                error!(error = %source, "Connection attempt failed");
                return Err(ConnectionError::Failed { broker_url, source });
            }
            Ok(Err(_)) => {
                shutdown.cancel();
                handle.abort();
                return Err(ConnectionError::EventLoopStopped { broker_url });
            }
            Err(_) => {
                shutdown.cancel();
                handle.abort();
                error!(timeout = ?timeout, "No connection acknowledgement");
                return Err(ConnectionError::Timeout {
                    broker_url,
                    timeout,
                });
            }
        }

        Ok(Session {
            client,
            broker_url,
            client_id,
            state_tx,
            state_rx,
            handoff_rx,
            pacing: PublishPacing::from(config),
            publish_timeout: config.publish_timeout(),
            close_grace: config.close_grace(),
            publish_lock: Mutex::new(HandOffSequence::new()),
            subscribe_lock: Mutex::new(()),
            registry,
            subacks,
            shutdown,
            event_loop_handle: Mutex::new(Some(handle)),
            delivery_tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Background task polling the `rumqttc` event loop for one session
struct EventLoopSupervisor {
    broker_url: String,
    event_loop: EventLoop,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    handoff_tx: watch::Sender<u64>,
    connack_tx: Option<oneshot::Sender<Result<(), rumqttc::ConnectionError>>>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    subacks: Arc<Mutex<SubAckTracker>>,
    observers: ConnectionObservers,
    shutdown: CancellationToken,
}

impl EventLoopSupervisor {
    async fn run(mut self) {
        debug!("MQTT event loop started");
        loop {
            let polled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                polled = self.event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    if !self.handle_event(&event).await {
                        break;
                    }
                }
                Err(e) => {
                    self.handle_error(e).await;
                    break;
                }
            }
        }
        debug!("MQTT event loop stopped");
    }

    /// Returns false once the loop should stop
    async fn handle_event(&mut self, event: &Event) -> bool {
        match MessageHandler::route_mqtt_event(event) {
            EventRoute::ConnectionAcknowledged => {
                self.state_tx.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });
                (self.observers.on_connect)(&self.broker_url);
                if let Some(tx) = self.connack_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                true
            }
            EventRoute::MessageReceived(message) => {
                self.deliver(message).await;
                true
            }
            EventRoute::SubscribeSent { packet_id } => {
                self.subacks.lock().await.on_subscribe_sent(packet_id);
                true
            }
            EventRoute::SubscriptionConfirmed { packet_id, ack } => {
                if !self.subacks.lock().await.on_suback(packet_id, ack) {
                    debug!(packet_id, "SUBACK without a waiting subscriber");
                }
                true
            }
            EventRoute::PublishHandedOff => {
                self.handoff_tx.send_modify(|count| *count += 1);
                true
            }
            EventRoute::DisconnectSent => {
                debug!("DISCONNECT sent to broker");
                false
            }
            EventRoute::Disconnected => {
                self.mark_lost("broker sent DISCONNECT".to_string()).await;
                false
            }
            EventRoute::InfrastructureEvent(description) => {
                debug!(event = %description, "MQTT infrastructure event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn deliver(&mut self, message: InboundMessage) {
        let delivered = self.registry.lock().await.dispatch(&message);
        if delivered == 0 {
            (self.observers.on_unmatched_message)(&message.topic, &message.payload_text());
        } else {
            debug!(topic = %message.topic, subscribers = delivered, "Message routed");
        }
    }

    async fn handle_error(&mut self, error: rumqttc::ConnectionError) {
        if let Some(tx) = self.connack_tx.take() {
            let _ = tx.send(Err(error));
            return;
        }

        let closing = self.shutdown.is_cancelled() || self.state_tx.borrow().is_terminated();
        if closing {
            debug!(error = %error, "Event loop error during close");
            return;
        }

        error!(error = %error, "MQTT connection error");
        self.mark_lost(error.to_string()).await;
    }

    async fn mark_lost(&mut self, reason: String) {
        let lost = self.state_tx.send_if_modified(|state| {
            if state.is_connected() {
                *state = ConnectionState::ConnectionLost(reason.clone());
                true
            } else {
                false
            }
        });

        if lost {
            self.subacks.lock().await.clear();
            (self.observers.on_connection_lost)(&reason);
        }
    }
}

/// An established connection to one broker.
///
/// Publish and subscribe may be called concurrently from any task. No reconnection is
/// attempted: once the connection is lost every later publish or subscribe fails with
/// `NotConnected`.
pub struct Session {
    client: AsyncClient,
    broker_url: String,
    client_id: String,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    handoff_rx: watch::Receiver<u64>,
    pacing: PublishPacing,
    publish_timeout: Duration,
    close_grace: Duration,
    publish_lock: Mutex<HandOffSequence>,
    subscribe_lock: Mutex<()>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    subacks: Arc<Mutex<SubAckTracker>>,
    shutdown: CancellationToken,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    delivery_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("broker_url", &self.broker_url)
            .field("client_id", &self.client_id)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every connection state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Number of routes currently receiving messages
    pub async fn subscription_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    fn ensure_connected(&self) -> Result<(), ConnectionState> {
        let state = self.connection_state();
        if state.is_connected() {
            Ok(())
        } else {
            Err(state)
        }
    }

    /// Publish `payload` to `topic` at QoS 0.
    ///
    /// Returns once the client has handed the message to the network, after which the
    /// configured pacing interval elapses before the next publish may start.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), PublishError> {
        if topic.is_empty() {
            return Err(PublishError::EmptyTopic);
        }
        self.ensure_connected()
            .map_err(|state| PublishError::NotConnected { state })?;

        let payload = payload.into();
        let mut sequence = self.publish_lock.lock().await;
        self.ensure_connected()
            .map_err(|state| PublishError::NotConnected { state })?;

        let mut handoffs = self.handoff_rx.clone();
        let mut state = self.state_rx.clone();

        debug!(topic = %topic, bytes = payload.len(), "Publishing");
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|source| PublishError::Request {
                topic: topic.to_string(),
                source,
            })?;
        let ticket = sequence.issue();

        let handed_off = tokio::time::timeout(self.publish_timeout, async {
            tokio::select! {
                done = HandOffSequence::handed_off(&mut handoffs, ticket) => done,
                _ = wait_until_not_connected(&mut state) => false,
            }
        })
        .await;

        match handed_off {
            Ok(true) => {}
            Ok(false) => {
                return Err(PublishError::NotConnected {
                    state: self.connection_state(),
                })
            }
            Err(_) => {
                warn!(
                    topic = %topic,
                    timeout = ?self.publish_timeout,
                    "Publish hand-off timed out"
                );
                return Err(PublishError::HandOffTimeout {
                    topic: topic.to_string(),
                    timeout: self.publish_timeout,
                });
            }
        }

        self.pacing.settle().await;
        Ok(())
    }

    /// Subscribe to `topic` at QoS 1, invoking `callback(topic, payload)` per message.
    ///
    /// Returns as soon as the request is queued. Use
    /// [`SubscriptionHandle::acknowledged`] to wait for the broker's answer.
    ///
    /// Each subscription buffers up to `DELIVERY_QUEUE_CAPACITY` messages for its
    /// callback. A callback that falls further behind loses messages, with a warning.
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        callback: F,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.subscribe_with(topic, Arc::new(callback)).await
    }

    /// Same as [`subscribe`](Self::subscribe) with an already shared callback
    pub async fn subscribe_with(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        if topic.is_empty() {
            return Err(SubscribeError::EmptyTopic);
        }
        self.ensure_connected()
            .map_err(|state| SubscribeError::NotConnected { state })?;

        let (message_tx, message_rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();

        // SUBACKs are matched to waiters in request order
        let order = self.subscribe_lock.lock().await;
        let id = self.registry.lock().await.register(topic, message_tx);
        self.subacks.lock().await.enqueue(ack_tx);

        if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
            self.subacks.lock().await.cancel_last();
            self.registry.lock().await.unregister(id);
            error!(topic = %topic, error = %e, "Subscribe request failed");
            return Err(SubscribeError::Request {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        drop(order);

        let token = self.shutdown.child_token();
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Pending);
        let task = DeliveryTask {
            id,
            topic: topic.to_string(),
            callback,
            ack: ack_rx,
            messages: message_rx,
            token: token.clone(),
            session_token: self.shutdown.clone(),
            status: status_tx,
            registry: self.registry.clone(),
            client: self.client.clone(),
        };
        let span = mqtt_span!(operation = "subscription", topic = %topic);
        let handle = tokio::spawn(task.run().instrument(span));

        let mut tasks = self.delivery_tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);

        debug!(
            topic = %topic,
            id,
            wildcard = is_wildcard_filter(topic),
            "Subscribe request queued"
        );
        Ok(SubscriptionHandle::new(id, topic, token, status_rx))
    }

    /// Disconnect from the broker and stop every subscription.
    ///
    /// In-flight work gets the configured grace period to settle. Once this returns no
    /// subscription callback will run again. Closing twice is a no-op.
    pub async fn close(&self) {
        let closing = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if !closing {
            debug!(broker = %self.broker_url, "Session already closed");
            return;
        }

        let deadline = Instant::now() + self.close_grace;
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "DISCONNECT could not be queued");
        }

        let event_loop = self.event_loop_handle.lock().await.take();
        if let Some(handle) = event_loop {
            join_within(handle, deadline, "event loop").await;
        }

        self.shutdown.cancel();
        let tasks: Vec<_> = self.delivery_tasks.lock().await.drain(..).collect();
        for handle in tasks {
            join_within(handle, deadline, "delivery task").await;
        }

        self.registry.lock().await.clear();
        self.subacks.lock().await.clear();
        info!(broker = %self.broker_url, "Session closed");
    }
}

#[async_trait]
impl Transport for Session {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        Session::publish(self, topic, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        self.subscribe_with(topic, callback).await
    }

    async fn close(&self) {
        Session::close(self).await
    }

    fn is_connected(&self) -> bool {
        Session::is_connected(self)
    }

    fn connection_state(&self) -> ConnectionState {
        Session::connection_state(self)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn wait_until_not_connected(state: &mut watch::Receiver<ConnectionState>) -> ConnectionState {
    loop {
        let current = state.borrow_and_update().clone();
        if !current.is_connected() {
            return current;
        }
        if state.changed().await.is_err() {
            return ConnectionState::Closed;
        }
    }
}

async fn join_within(mut handle: JoinHandle<()>, deadline: Instant, what: &str) {
    if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
        warn!("{what} did not stop within the close grace period, aborting");
        handle.abort();
        let _ = handle.await;
    }
}
