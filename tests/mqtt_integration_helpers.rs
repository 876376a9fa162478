//! MQTT Integration Test Helpers
//!
//! Broker-backed tests expect a plain MQTT broker at localhost:1883 and are ignored
//! by default. Run them with `cargo test -- --ignored`.

#![allow(dead_code)]

use mqtt_eventbus::config::ConnectionConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MQTT_BROKER_HOST: &str = "localhost";
pub const MQTT_BROKER_PORT: u16 = 1883;

/// Config pointing at the local broker with a unique client id and fast pacing
pub fn broker_config(client: &str) -> ConnectionConfig {
    ConnectionConfig::new(MQTT_BROKER_HOST, MQTT_BROKER_PORT)
        .with_client_id(format!("{client}-{}", uuid::Uuid::new_v4().simple()))
        .with_min_publish_interval(Duration::from_millis(10))
}

/// Topic unique to one test run so parallel tests never see each other's messages
pub fn unique_topic(name: &str) -> String {
    format!("eventbus-tests/{}/{name}", uuid::Uuid::new_v4().simple())
}

/// Shared sink collecting `(topic, payload)` pairs from a callback
pub type Received = Arc<Mutex<Vec<(String, String)>>>;

pub fn recorder() -> (Received, impl Fn(&str, &str) + Send + Sync + 'static) {
    let received: Received = Arc::default();
    let sink = received.clone();
    let callback = move |topic: &str, payload: &str| {
        sink.lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
    };
    (received, callback)
}

/// Poll until `received` holds at least `count` entries or the timeout passes
pub async fn wait_for_messages(received: &Received, count: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if received.lock().unwrap().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    received.lock().unwrap().len() >= count
}
