//! Telemetry: structured logging, operation spans and metrics emitters.

mod logging;
pub mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use spans::{connection_span, OperationSpan, SpanExt};
