//! MQTT session implementation on top of `rumqttc`
//!
//! Pure logic and I/O live in separate modules so the routing and state rules can be
//! tested without a broker.
//!
//! - [`connection`] - session state, publish pacing and option mapping
//! - [`message_handler`] - event routing, subscription registry and SUBACK correlation
//! - [`observers`] - connection lifecycle hooks
//! - [`subscription`] - per-subscription delivery tasks and handles
//! - [`tls`] - trust material for mutual TLS
//! - [`client`] - the session and its event loop
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_eventbus::config::ConnectionConfig;
//! use mqtt_eventbus::transport::mqtt::ConnectionManager;
//!
//! # tokio_test::block_on(async {
//! let config = ConnectionConfig::new("localhost", 1883);
//! let session = ConnectionManager::new().connect(&config).await?;
//!
//! let handle = session
//!     .subscribe("sensors/+/temperature", |topic, payload| {
//!         println!("{topic}: {payload}");
//!     })
//!     .await?;
//! handle.acknowledged().await?;
//!
//! session.publish("sensors/kitchen/temperature", "21.5").await?;
//! session.close().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod observers;
pub mod subscription;
pub mod tls;

pub use client::{ConnectionManager, Session};
pub use connection::{configure_mqtt_options, ConnectionState, HandOffSequence, PublishPacing};
pub use message_handler::{
    EventRoute, InboundMessage, MessageHandler, SubAckTracker, SubscriptionAck,
    SubscriptionRegistry, DELIVERY_QUEUE_CAPACITY,
};
pub use observers::{ConnectCallback, ConnectionLostCallback, ConnectionObservers, MessageCallback};
pub use subscription::{SubscriptionHandle, SubscriptionStatus};
pub use tls::{ServerVerification, TrustMaterial};
