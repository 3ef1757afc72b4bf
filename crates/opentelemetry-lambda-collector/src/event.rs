//! Telemetry API event model.
//!
//! The Telemetry API delivers JSON arrays of `{time, type, record}` objects.
//! `record` is an object for platform events and either an object or a plain
//! string for function and extension logs, so it is kept as a
//! [`serde_json::Value`] and decoded into the typed records below on demand.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single event pushed by the Telemetry API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event time in RFC 3339 format.
    pub time: String,
    /// Event type discriminator, e.g. `platform.start` or `function`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub record: serde_json::Value,
}

impl Event {
    /// Creates an event.
    pub fn new(
        time: impl Into<String>,
        event_type: impl Into<String>,
        record: serde_json::Value,
    ) -> Self {
        Self {
            time: time.into(),
            event_type: event_type.into(),
            record,
        }
    }

    /// Returns the parsed event type.
    pub fn kind(&self) -> EventType {
        EventType::parse(&self.event_type)
    }

    /// Returns the event time in nanoseconds since the Unix epoch.
    pub fn time_unix_nano(&self) -> Option<u64> {
        parse_rfc3339_nanos(&self.time)
    }

    /// Returns a string field of an object record.
    pub fn record_str(&self, key: &str) -> Option<&str> {
        self.record.get(key).and_then(|v| v.as_str())
    }

    /// Returns `record.requestId` when present.
    pub fn request_id(&self) -> Option<&str> {
        self.record_str("requestId")
    }

    /// Decodes the record into a typed struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.record)
    }
}

/// Known Telemetry API event types.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// `platform.initStart`
    InitStart,
    /// `platform.initRuntimeDone`
    InitRuntimeDone,
    /// `platform.initReport`
    InitReport,
    /// `platform.start`
    Start,
    /// `platform.runtimeDone`
    RuntimeDone,
    /// `platform.report`
    Report,
    /// `platform.restoreStart`
    RestoreStart,
    /// `platform.restoreRuntimeDone`
    RestoreRuntimeDone,
    /// `platform.restoreReport`
    RestoreReport,
    /// `platform.telemetrySubscription`
    TelemetrySubscription,
    /// `platform.extension`
    Extension,
    /// `platform.logsDropped`
    LogsDropped,
    /// Function log line (`function`).
    FunctionLog,
    /// Extension log line (`extension`).
    ExtensionLog,
    /// Any type this crate does not know about.
    Unknown,
}

impl EventType {
    /// Parses the `type` field of an event.
    pub fn parse(value: &str) -> Self {
        match value {
            "platform.initStart" => EventType::InitStart,
            "platform.initRuntimeDone" => EventType::InitRuntimeDone,
            "platform.initReport" => EventType::InitReport,
            "platform.start" => EventType::Start,
            "platform.runtimeDone" => EventType::RuntimeDone,
            "platform.report" => EventType::Report,
            "platform.restoreStart" => EventType::RestoreStart,
            "platform.restoreRuntimeDone" => EventType::RestoreRuntimeDone,
            "platform.restoreReport" => EventType::RestoreReport,
            "platform.telemetrySubscription" => EventType::TelemetrySubscription,
            "platform.extension" => EventType::Extension,
            "platform.logsDropped" => EventType::LogsDropped,
            "function" => EventType::FunctionLog,
            "extension" => EventType::ExtensionLog,
            _ => EventType::Unknown,
        }
    }

    /// Returns the wire name, or `unknown`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InitStart => "platform.initStart",
            EventType::InitRuntimeDone => "platform.initRuntimeDone",
            EventType::InitReport => "platform.initReport",
            EventType::Start => "platform.start",
            EventType::RuntimeDone => "platform.runtimeDone",
            EventType::Report => "platform.report",
            EventType::RestoreStart => "platform.restoreStart",
            EventType::RestoreRuntimeDone => "platform.restoreRuntimeDone",
            EventType::RestoreReport => "platform.restoreReport",
            EventType::TelemetrySubscription => "platform.telemetrySubscription",
            EventType::Extension => "platform.extension",
            EventType::LogsDropped => "platform.logsDropped",
            EventType::FunctionLog => "function",
            EventType::ExtensionLog => "extension",
            EventType::Unknown => "unknown",
        }
    }

    /// Returns true for `platform.*` events.
    pub fn is_platform(&self) -> bool {
        !matches!(
            self,
            EventType::FunctionLog | EventType::ExtensionLog | EventType::Unknown
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported by `*RuntimeDone` and `*Report` events.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// The phase completed.
    Success,
    /// The function or runtime reported a failure.
    Failure,
    /// The platform reported an error.
    Error,
    /// The phase exceeded its deadline.
    Timeout,
    /// Any other value.
    Other(String),
}

impl Status {
    /// Parses a status string.
    pub fn parse(value: &str) -> Self {
        match value {
            "success" => Status::Success,
            "failure" => Status::Failure,
            "error" => Status::Error,
            "timeout" => Status::Timeout,
            other => Status::Other(other.to_string()),
        }
    }

    /// Returns true for `failure` and `error`.
    pub fn is_error(&self) -> bool {
        matches!(self, Status::Failure | Status::Error)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Status::parse(&value))
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Other(String::new())
    }
}

/// Record for `platform.initStart`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitStartRecord {
    /// Function name.
    pub function_name: Option<String>,
    /// Function version.
    pub function_version: Option<String>,
    /// Initialization type (on-demand, provisioned-concurrency, snap-start).
    pub initialization_type: Option<String>,
    /// Phase (`init` or `invoke`).
    pub phase: Option<String>,
    /// Runtime version.
    pub runtime_version: Option<String>,
    /// Runtime version ARN.
    pub runtime_version_arn: Option<String>,
}

/// Record for `platform.initRuntimeDone` and `platform.restoreRuntimeDone`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitRuntimeDoneRecord {
    /// Initialization type.
    pub initialization_type: Option<String>,
    /// Phase.
    pub phase: Option<String>,
    /// Outcome.
    pub status: Status,
    /// Error classification when the phase failed.
    pub error_type: Option<String>,
}

/// Record for `platform.initReport` and `platform.restoreReport`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitReportRecord {
    /// Initialization type.
    pub initialization_type: Option<String>,
    /// Phase.
    pub phase: Option<String>,
    /// Outcome.
    pub status: Status,
    /// Error classification when the phase failed.
    pub error_type: Option<String>,
    /// Phase metrics.
    pub metrics: DurationMetrics,
}

/// Metrics carrying only a duration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DurationMetrics {
    /// Duration in milliseconds.
    pub duration_ms: f64,
}

/// Record for `platform.start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRecord {
    /// Request ID for this invocation.
    pub request_id: String,
    /// Version of the function.
    #[serde(default)]
    pub version: Option<String>,
    /// Tracing information.
    #[serde(default)]
    pub tracing: Option<TracingRecord>,
}

/// Tracing information in platform events.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracingRecord {
    /// Span ID.
    pub span_id: Option<String>,
    /// Trace type, e.g. `X-Amzn-Trace-Id`.
    #[serde(rename = "type")]
    pub trace_type: Option<String>,
    /// Trace header value.
    pub value: Option<String>,
}

/// Record for `platform.runtimeDone`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDoneRecord {
    /// Request ID for this invocation.
    pub request_id: String,
    /// Outcome.
    #[serde(default)]
    pub status: Status,
    /// Error classification when the invocation failed.
    #[serde(default)]
    pub error_type: Option<String>,
    /// Runtime metrics.
    #[serde(default)]
    pub metrics: Option<DurationMetrics>,
}

/// Record for `platform.report`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    /// Request ID for this invocation.
    pub request_id: String,
    /// Outcome.
    #[serde(default)]
    pub status: Status,
    /// Report metrics.
    #[serde(default)]
    pub metrics: ReportMetrics,
}

/// Metrics from `platform.report`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportMetrics {
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// Billed duration in milliseconds.
    pub billed_duration_ms: f64,
    /// Configured memory in MB.
    #[serde(rename = "memorySizeMB")]
    pub memory_size_mb: f64,
    /// Peak memory used in MB.
    #[serde(rename = "maxMemoryUsedMB")]
    pub max_memory_used_mb: f64,
    /// Init duration in milliseconds (cold start only).
    pub init_duration_ms: Option<f64>,
    /// Restore duration in milliseconds (SnapStart only).
    pub restore_duration_ms: Option<f64>,
}

/// Object form of a `function` or `extension` log record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StructuredLogRecord {
    /// Timestamp written by the logging library.
    pub timestamp: Option<String>,
    /// Level name.
    pub level: Option<String>,
    /// Invocation the line belongs to.
    pub request_id: Option<String>,
    /// Log message.
    pub message: Option<serde_json::Value>,
    /// Hex trace id, when the logger recorded one.
    pub trace_id: Option<String>,
    /// Hex span id, when the logger recorded one.
    pub span_id: Option<String>,
}

/// Parses an RFC 3339 timestamp into nanoseconds since the Unix epoch.
pub fn parse_rfc3339_nanos(timestamp: &str) -> Option<u64> {
    let ts = chrono::DateTime::parse_from_rfc3339(timestamp).ok()?;
    u64::try_from(ts.timestamp_nanos_opt()?).ok()
}
