//! MQTT event bus
//!
//! A connection and messaging facade over an MQTT broker: build a session from a
//! [`ConnectionConfig`], optionally with mutual TLS, then publish text payloads and
//! register per-topic callbacks.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_eventbus::{ConnectionConfig, ConnectionManager};
//!
//! # tokio_test::block_on(async {
//! let config = ConnectionConfig::new("localhost", 1883).with_client_id("sensor-gateway");
//! let session = ConnectionManager::new().connect(&config).await?;
//!
//! session
//!     .subscribe("alerts/#", |topic, payload| println!("{topic}: {payload}"))
//!     .await?;
//! session.publish("alerts/door", "open").await?;
//!
//! session.close().await;
//! # Ok::<(), mqtt_eventbus::EventBusError>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod topics;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, Scheme};
pub use error::{
    ConnectionError, EventBusError, EventBusResult, PublishError, SubscribeError, TlsConfigError,
};
pub use topics::{routing_filter, topic_matches};
pub use transport::mqtt::{
    ConnectionManager, ConnectionObservers, ConnectionState, Session, SubscriptionHandle,
};
pub use transport::Transport;
