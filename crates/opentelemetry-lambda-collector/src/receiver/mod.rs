//! Pipeline receivers.
//!
//! - `telemetryapi` / `telemetryapi_logs`: subscribe to the Lambda Telemetry
//!   API and translate what it pushes
//! - `otlp`: OTLP/HTTP endpoint for the function's own instrumentation

mod otlp;
mod telemetry;

pub use otlp::{OtlpReceiver, OtlpReceiverConfig, OtlpReceiverFactory};
pub use telemetry::{TelemetryReceiver, TelemetryReceiverConfig, TelemetryReceiverFactory};
