//! Observability for the event bus: structured logging and span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LoggingConfig};

// Span macros for structured logging
pub use logging::{command_span, mqtt_span};
