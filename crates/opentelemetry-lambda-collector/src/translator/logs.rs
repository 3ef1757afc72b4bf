//! Log record synthesis for function output and platform events.

use super::kv_string;
use super::severity::{severity_number, severity_text};
use crate::event::{
    Event, EventType, InitStartRecord, ReportRecord, StartRecord, StructuredLogRecord,
    parse_rfc3339_nanos,
};
use crate::resource::semconv;
use crate::trace_context::{parse_span_id, parse_trace_id};
use opentelemetry_proto::tonic::common::v1::{AnyValue, any_value};
use opentelemetry_proto::tonic::logs::v1::LogRecord;

/// Attribute carrying the Telemetry API event type.
pub const EVENT_TYPE_ATTRIBUTE: &str = "type";

const INFO_SEVERITY: i32 = 9;

fn string_body(value: impl Into<String>) -> Option<AnyValue> {
    Some(AnyValue {
        value: Some(any_value::Value::StringValue(value.into())),
    })
}

fn base_record(event: &Event, time: u64, observed: u64) -> LogRecord {
    LogRecord {
        time_unix_nano: time,
        observed_time_unix_nano: observed,
        attributes: vec![kv_string(EVENT_TYPE_ATTRIBUTE, &event.event_type)],
        ..Default::default()
    }
}

/// Translates a `function` or `extension` event.
///
/// `current_invocation` is attached to plain-text lines, which carry no
/// request id of their own.
pub(crate) fn function_log(
    event: &Event,
    time: u64,
    observed: u64,
    current_invocation: Option<&str>,
) -> LogRecord {
    let mut record = base_record(event, time, observed);

    match &event.record {
        serde_json::Value::Object(_) => {
            let structured: StructuredLogRecord = match event.decode() {
                Ok(structured) => structured,
                Err(error) => {
                    tracing::warn!(%error, "Malformed structured log record");
                    StructuredLogRecord::default()
                }
            };
            apply_structured(&mut record, structured);
        }
        serde_json::Value::String(line) => {
            record.body = string_body(line.as_str());
            if let Some(id) = current_invocation {
                record
                    .attributes
                    .push(kv_string(semconv::FAAS_INVOCATION_ID, id));
            }
        }
        serde_json::Value::Null => {}
        other => record.body = string_body(other.to_string()),
    }

    record
}

fn apply_structured(record: &mut LogRecord, structured: StructuredLogRecord) {
    if let Some(timestamp) = structured.timestamp.as_deref() {
        match parse_rfc3339_nanos(timestamp) {
            Some(nanos) => record.time_unix_nano = nanos,
            None => tracing::warn!(timestamp, "Unparseable log timestamp, keeping event time"),
        }
    }

    if let Some(level) = structured.level.as_deref() {
        record.severity_text = severity_text(level);
        record.severity_number = severity_number(level);
    }

    if let Some(id) = structured.request_id.as_deref() {
        record
            .attributes
            .push(kv_string(semconv::FAAS_INVOCATION_ID, id));
    }

    match structured.message {
        Some(serde_json::Value::String(message)) => record.body = string_body(message),
        Some(serde_json::Value::Null) | None => {}
        Some(other) => record.body = string_body(other.to_string()),
    }

    if let Some(trace_id) = structured.trace_id.as_deref() {
        match parse_trace_id(trace_id) {
            Some(id) => record.trace_id = id.to_vec(),
            None => tracing::warn!(trace_id, "Dropping malformed trace id on log record"),
        }
    }

    if let Some(span_id) = structured.span_id.as_deref() {
        match parse_span_id(span_id) {
            Some(id) => record.span_id = id.to_vec(),
            None => tracing::warn!(span_id, "Dropping malformed span id on log record"),
        }
    }
}

/// Renders a `platform.*` event as a human-readable log line.
pub(crate) fn platform_log(event: &Event, time: u64, observed: u64) -> LogRecord {
    let mut record = base_record(event, time, observed);
    record.severity_text = "INFO".to_string();
    record.severity_number = INFO_SEVERITY;

    if let Some(id) = event.request_id() {
        record
            .attributes
            .push(kv_string(semconv::FAAS_INVOCATION_ID, id));
    }

    let line = match event.kind() {
        EventType::Start => event.decode::<StartRecord>().ok().map(|r| {
            format!(
                "START RequestId: {} Version: {}",
                r.request_id,
                r.version.as_deref().unwrap_or("$LATEST")
            )
        }),
        EventType::RuntimeDone => event
            .request_id()
            .map(|id| format!("END RequestId: {id}")),
        EventType::Report => event.decode::<ReportRecord>().ok().map(|r| render_report(&r)),
        EventType::InitStart => event.decode::<InitStartRecord>().ok().map(|r| {
            format!(
                "INIT_START Runtime Version: {} Runtime Version ARN: {}",
                r.runtime_version.as_deref().unwrap_or_default(),
                r.runtime_version_arn.as_deref().unwrap_or_default()
            )
        }),
        _ => None,
    };

    record.body = string_body(line.unwrap_or_else(|| event.record.to_string()));
    record
}

fn render_report(record: &ReportRecord) -> String {
    let m = &record.metrics;
    let mut line = format!(
        "REPORT RequestId: {} Duration: {:.2} ms Billed Duration: {:.0} ms Memory Size: {:.0} MB Max Memory Used: {:.0} MB",
        record.request_id, m.duration_ms, m.billed_duration_ms, m.memory_size_mb, m.max_memory_used_mb
    );
    if let Some(init) = m.init_duration_ms {
        line.push_str(&format!(" Init Duration: {init:.2} ms"));
    }
    line
}
