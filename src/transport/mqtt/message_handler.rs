//! Pure message routing and dispatch logic for MQTT events
//!
//! This module turns `rumqttc` events into routing decisions, fans inbound messages
//! out to the subscriptions whose filters match, and correlates SUBACKs with the
//! subscribe calls that caused them.

use crate::topics::{routing_filter, topic_matches};
use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                }),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    ack: Self::interpret_suback(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(_) => EventRoute::PublishHandedOff,
                Outgoing::Subscribe(packet_id) => EventRoute::SubscribeSent {
                    packet_id: *packet_id,
                },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// A SUBACK for a single filter succeeds only if every return code does
    pub fn interpret_suback(return_codes: &[SubscribeReasonCode]) -> SubscriptionAck {
        let mut granted = None;
        for code in return_codes {
            match code {
                SubscribeReasonCode::Success(qos) => granted = granted.or(Some(*qos)),
                SubscribeReasonCode::Failure => return SubscriptionAck::Rejected,
            }
        }
        granted.map_or(SubscriptionAck::Rejected, SubscriptionAck::Granted)
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received from the broker
    MessageReceived(InboundMessage),
    /// Broker closed the session
    Disconnected,
    /// Broker answered a SUBSCRIBE
    SubscriptionConfirmed { packet_id: u16, ack: SubscriptionAck },
    /// A PUBLISH was written to the network
    PublishHandedOff,
    /// A SUBSCRIBE was written to the network with this packet id
    SubscribeSent { packet_id: u16 },
    /// Our DISCONNECT was written to the network
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Broker's answer to a subscribe request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAck {
    Granted(QoS),
    Rejected,
}

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload decoded as text, replacing invalid UTF-8 sequences
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Messages buffered per subscription while its callback is busy
pub const DELIVERY_QUEUE_CAPACITY: usize = 1024;

struct Route {
    id: u64,
    filter: String,
    pattern: String,
    sender: mpsc::Sender<InboundMessage>,
}

/// Active subscriptions and the channels feeding their delivery tasks
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    routes: Vec<Route>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter and return its subscription id
    pub fn register(
        &mut self,
        filter: impl Into<String>,
        sender: mpsc::Sender<InboundMessage>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let filter = filter.into();
        self.routes.push(Route {
            id,
            pattern: routing_filter(&filter).to_string(),
            filter,
            sender,
        });
        id
    }

    /// Remove a subscription, returning its filter
    pub fn unregister(&mut self, id: u64) -> Option<String> {
        let index = self.routes.iter().position(|route| route.id == id)?;
        Some(self.routes.remove(index).filter)
    }

    /// Whether any live subscription still uses `filter`
    pub fn has_filter(&self, filter: &str) -> bool {
        self.routes.iter().any(|route| route.filter == filter)
    }

    /// Hand `message` to every subscription whose filter matches.
    ///
    /// Never blocks the event loop: when a subscription's queue is full the message is
    /// dropped for that subscription and a warning is logged.
    ///
    /// Returns the number of live subscriptions whose filter matched. Zero means the
    /// message belongs to the unmatched-message observer.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let mut matched = 0;
        for route in &self.routes {
            if !topic_matches(&route.pattern, &message.topic) {
                continue;
            }
            match route.sender.try_send(message.clone()) {
                Ok(()) => matched += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    matched += 1;
                    warn!(
                        subscription = route.id,
                        topic = %message.topic,
                        "Delivery queue full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscription = route.id, "Delivery task gone, dropping message");
                }
            }
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Drop every route, closing all delivery channels
    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

/// Correlates SUBACKs with pending subscribe calls.
///
/// `rumqttc` does not return packet ids from `subscribe`, but it writes requests in
/// the order they were queued. Waiters are queued in the same order under a lock,
/// bound to a packet id when the SUBSCRIBE goes out, and resolved by the SUBACK.
#[derive(Default)]
pub struct SubAckTracker {
    queued: VecDeque<oneshot::Sender<SubscriptionAck>>,
    in_flight: HashMap<u16, oneshot::Sender<SubscriptionAck>>,
}

impl SubAckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter for the next SUBSCRIBE written
    pub fn enqueue(&mut self, waiter: oneshot::Sender<SubscriptionAck>) {
        self.queued.push_back(waiter);
    }

    /// Withdraw the most recent waiter when its request never reached the client
    pub fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    /// Bind the oldest queued waiter to the packet id just written
    pub fn on_subscribe_sent(&mut self, packet_id: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.in_flight.insert(packet_id, waiter);
        }
    }

    /// Resolve the waiter for `packet_id`; returns false if nobody was waiting
    pub fn on_suback(&mut self, packet_id: u16, ack: SubscriptionAck) -> bool {
        match self.in_flight.remove(&packet_id) {
            Some(waiter) => waiter.send(ack).is_ok(),
            None => false,
        }
    }

    /// Number of subscribe calls still waiting for a SUBACK
    pub fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    /// Drop every waiter; their receivers observe the subscription as cancelled
    pub fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}
