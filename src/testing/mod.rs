//! Testing utilities and mock implementations
//!
//! This module provides an in-memory transport for testing event bus consumers
//! without an MQTT broker.

pub mod mocks;

pub use mocks::*;
