//! Telemetry API event to OTLP signal translation.
//!
//! A [`Translator`] turns each batch pushed by the Telemetry API into at most
//! one OTLP request per signal kind:
//!
//! - **Logs**: function and extension output, plus rendered platform events
//!   when `log_report` is enabled
//! - **Metrics**: FaaS counters and histograms, emitted after every batch
//!   that contained a contributing platform event
//! - **Traces**: an `init <function>` span for the cold start and a
//!   `platform.invoke` span per invocation
//!
//! State that spans batches (open init and invocation phases, the current
//! invocation id, the metric aggregations) lives behind a single mutex that
//! is held for the whole batch, so concurrent batches cannot interleave.

mod logs;
mod metrics;
mod severity;
mod spans;

pub use logs::EVENT_TYPE_ATTRIBUTE;
pub use metrics::{
    CounterBuilder, DEFAULT_BOUNDS, DURATION_BOUNDS, FaasMetrics, HistogramBuilder, MEMORY_BOUNDS,
    Temporality, bucket_index,
};
pub use severity::{severity_number, severity_text};
pub use spans::INVOKE_SPAN_NAME;

use crate::event::{
    Event, EventType, InitReportRecord, InitRuntimeDoneRecord, InitStartRecord, ReportRecord,
    RuntimeDoneRecord, StartRecord, Status,
};
use crate::resource::{detect_resource, to_proto_resource};
use crate::signal::Signal;
use crate::trace_context::TraceContext;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue, any_value};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::{Metric, ResourceMetrics, ScopeMetrics};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use spans::{InitPhase, InvocationPhase};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Instrumentation scope name stamped on every translated signal.
///
/// The FaaS processor relies on it to tell platform spans from spans
/// produced by the function's own instrumentation.
pub const SCOPE_NAME: &str = "opentelemetry-lambda-collector/telemetryapi";
/// Instrumentation scope version.
pub const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

const FUNCTION_NAME_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// Creates a string key-value pair.
pub(crate) fn kv_string(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

/// Creates a boolean key-value pair.
pub(crate) fn kv_bool(key: &str, value: bool) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::BoolValue(value)),
        }),
    }
}

fn scope() -> InstrumentationScope {
    InstrumentationScope {
        name: SCOPE_NAME.to_string(),
        version: SCOPE_VERSION.to_string(),
        ..Default::default()
    }
}

fn current_time_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Signals produced from one batch of events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    /// Spans completed by this batch.
    pub traces: Option<ExportTraceServiceRequest>,
    /// Metrics due after this batch.
    pub metrics: Option<ExportMetricsServiceRequest>,
    /// Log records from this batch.
    pub logs: Option<ExportLogsServiceRequest>,
}

impl Translation {
    /// Returns true when the batch produced nothing.
    pub fn is_empty(&self) -> bool {
        self.traces.is_none() && self.metrics.is_none() && self.logs.is_none()
    }

    /// Returns the produced signals in trace, metric, log order.
    pub fn into_signals(self) -> Vec<Signal> {
        let mut signals = Vec::with_capacity(3);
        if let Some(traces) = self.traces {
            signals.push(Signal::Traces(traces));
        }
        if let Some(metrics) = self.metrics {
            signals.push(Signal::Metrics(metrics));
        }
        if let Some(logs) = self.logs {
            signals.push(Signal::Logs(logs));
        }
        signals
    }
}

#[derive(Debug)]
struct State {
    current_invocation: Option<String>,
    init: Option<InitPhase>,
    invocations: HashMap<String, InvocationPhase>,
    metrics: FaasMetrics,
}

/// Builder for [`Translator`].
#[must_use = "builders do nothing unless .build() is called"]
#[derive(Debug, Clone, Default)]
pub struct TranslatorBuilder {
    log_report: bool,
    temporality: Temporality,
    service_instance_id: Option<String>,
    resource: Option<Resource>,
}

impl TranslatorBuilder {
    /// Renders `platform.*` events as log records.
    pub fn log_report(mut self, enabled: bool) -> Self {
        self.log_report = enabled;
        self
    }

    /// Sets the metric aggregation temporality.
    pub fn temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }

    /// Adds `service.instance.id` to the detected resource.
    pub fn service_instance_id(mut self, id: impl Into<String>) -> Self {
        self.service_instance_id = Some(id.into());
        self
    }

    /// Replaces resource detection with a fixed resource.
    pub fn resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Builds the translator, detecting the resource from the environment
    /// unless one was given.
    pub fn build(self) -> Translator {
        let resource = self.resource.unwrap_or_else(|| {
            to_proto_resource(&detect_resource(self.service_instance_id.as_deref()))
        });

        Translator {
            resource,
            log_report: self.log_report,
            state: Mutex::new(State {
                current_invocation: None,
                init: None,
                invocations: HashMap::new(),
                metrics: FaasMetrics::new(self.temporality, current_time_nanos()),
            }),
        }
    }
}

/// Converts Telemetry API events to OTLP requests.
#[derive(Debug)]
pub struct Translator {
    resource: Resource,
    log_report: bool,
    state: Mutex<State>,
}

impl Translator {
    /// Creates a builder.
    pub fn builder() -> TranslatorBuilder {
        TranslatorBuilder::default()
    }

    /// Returns the resource stamped on every signal.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Returns the invocation the most recent `platform.start` opened, until
    /// its `platform.runtimeDone` arrives.
    pub fn current_invocation(&self) -> Option<String> {
        self.lock().current_invocation.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Translates one batch of events.
    pub fn translate(&self, events: &[Event]) -> Translation {
        let observed = current_time_nanos();
        let mut state = self.lock();

        let mut spans = Vec::new();
        let mut log_records = Vec::new();
        let mut metrics_touched = false;

        for event in events {
            let time = event.time_unix_nano().unwrap_or_else(|| {
                tracing::debug!(time = %event.time, "Unparseable event time, using now");
                observed
            });
            let kind = event.kind();

            match kind {
                EventType::FunctionLog | EventType::ExtensionLog => {
                    log_records.push(logs::function_log(
                        event,
                        time,
                        observed,
                        state.current_invocation.as_deref(),
                    ));
                    continue;
                }
                EventType::Unknown => {
                    tracing::debug!(event_type = %event.event_type, "Ignoring unknown event type");
                    continue;
                }
                _ => {}
            }

            if self.log_report {
                log_records.push(logs::platform_log(event, time, observed));
            }

            match kind {
                EventType::InitStart => {
                    let record: InitStartRecord = decode_or_default(event);
                    let function_name = record
                        .function_name
                        .or_else(|| std::env::var(FUNCTION_NAME_ENV).ok())
                        .unwrap_or_default();
                    state.init = Some(InitPhase {
                        start_time: time,
                        function_name,
                    });
                    state.metrics.coldstarts.add(1);
                    metrics_touched = true;
                }
                EventType::InitRuntimeDone => {
                    let record: InitRuntimeDoneRecord = decode_or_default(event);
                    if let Some(phase) = state.init.take() {
                        spans.push(spans::init_span(
                            &phase,
                            time,
                            &record.status,
                            record.error_type.as_deref(),
                        ));
                    }
                }
                EventType::InitReport => {
                    let record: InitReportRecord = decode_or_default(event);
                    count_outcome(&mut state.metrics, &record.status, false);
                    state
                        .metrics
                        .init_duration
                        .record(record.metrics.duration_ms / 1000.0);
                    metrics_touched = true;
                }
                EventType::Start => match event.decode::<StartRecord>() {
                    Ok(record) => {
                        let context = record
                            .tracing
                            .as_ref()
                            .and_then(|t| t.value.as_deref())
                            .and_then(TraceContext::from_xray);
                        state.invocations.insert(
                            record.request_id.clone(),
                            InvocationPhase {
                                start_time: time,
                                context,
                            },
                        );
                        state.current_invocation = Some(record.request_id);
                    }
                    Err(error) => tracing::warn!(%error, "Malformed platform.start record"),
                },
                EventType::RuntimeDone => match event.decode::<RuntimeDoneRecord>() {
                    Ok(record) => {
                        count_outcome(&mut state.metrics, &record.status, true);
                        if let Some(m) = &record.metrics {
                            state.metrics.invoke_duration.record(m.duration_ms / 1000.0);
                        }
                        metrics_touched = true;

                        if let Some(phase) = state.invocations.remove(&record.request_id) {
                            spans.push(spans::invoke_span(
                                &record.request_id,
                                &phase,
                                time,
                                &record.status,
                                record.error_type.as_deref(),
                            ));
                        }
                        state.current_invocation = None;
                    }
                    Err(error) => tracing::warn!(%error, "Malformed platform.runtimeDone record"),
                },
                EventType::Report => match event.decode::<ReportRecord>() {
                    Ok(record) => {
                        state
                            .metrics
                            .mem_usage
                            .record(record.metrics.max_memory_used_mb * 1e6);
                        metrics_touched = true;
                    }
                    Err(error) => tracing::warn!(%error, "Malformed platform.report record"),
                },
                _ => {}
            }
        }

        let metrics = if metrics_touched {
            state.metrics.collect(observed)
        } else {
            Vec::new()
        };
        drop(state);

        Translation {
            traces: (!spans.is_empty()).then(|| self.traces_request(spans)),
            metrics: (!metrics.is_empty()).then(|| self.metrics_request(metrics)),
            logs: (!log_records.is_empty()).then(|| self.logs_request(log_records)),
        }
    }

    fn traces_request(&self, spans: Vec<Span>) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(self.resource.clone()),
                scope_spans: vec![ScopeSpans {
                    scope: Some(scope()),
                    spans,
                    schema_url: SCHEMA_URL.to_string(),
                }],
                schema_url: SCHEMA_URL.to_string(),
            }],
        }
    }

    fn metrics_request(&self, metrics: Vec<Metric>) -> ExportMetricsServiceRequest {
        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(self.resource.clone()),
                scope_metrics: vec![ScopeMetrics {
                    scope: Some(scope()),
                    metrics,
                    schema_url: SCHEMA_URL.to_string(),
                }],
                schema_url: SCHEMA_URL.to_string(),
            }],
        }
    }

    fn logs_request(&self, log_records: Vec<LogRecord>) -> ExportLogsServiceRequest {
        ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: Some(self.resource.clone()),
                scope_logs: vec![ScopeLogs {
                    scope: Some(scope()),
                    log_records,
                    schema_url: SCHEMA_URL.to_string(),
                }],
                schema_url: SCHEMA_URL.to_string(),
            }],
        }
    }
}

fn decode_or_default<T: serde::de::DeserializeOwned + Default>(event: &Event) -> T {
    event.decode().unwrap_or_else(|error| {
        tracing::warn!(%error, event_type = %event.event_type, "Malformed platform record");
        T::default()
    })
}

/// Counts an init or invocation outcome. Only invocations count successes.
fn count_outcome(metrics: &mut FaasMetrics, status: &Status, invocation: bool) {
    match status {
        Status::Success if invocation => metrics.invocations.add(1),
        Status::Failure | Status::Error => metrics.errors.add(1),
        Status::Timeout => metrics.timeouts.add(1),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::metrics::v1::{metric::Data, number_data_point};
    use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
    use opentelemetry_proto::tonic::trace::v1::status;
    use serde_json::json;

    fn translator() -> Translator {
        Translator::builder()
            .resource(Resource::default())
            .build()
    }

    fn event(time: &str, event_type: &str, record: serde_json::Value) -> Event {
        Event::new(time, event_type, record)
    }

    fn spans(translation: &Translation) -> Vec<Span> {
        translation
            .traces
            .iter()
            .flat_map(|t| &t.resource_spans)
            .flat_map(|rs| &rs.scope_spans)
            .flat_map(|ss| ss.spans.clone())
            .collect()
    }

    fn metric<'a>(translation: &'a Translation, name: &str) -> Option<&'a Metric> {
        translation
            .metrics
            .iter()
            .flat_map(|m| &m.resource_metrics)
            .flat_map(|rm| &rm.scope_metrics)
            .flat_map(|sm| &sm.metrics)
            .find(|m| m.name == name)
    }

    fn counter_value(metric: &Metric) -> i64 {
        match &metric.data {
            Some(Data::Sum(sum)) => match sum.data_points[0].value {
                Some(number_data_point::Value::AsInt(v)) => v,
                _ => panic!("not an int sum"),
            },
            _ => panic!("not a sum"),
        }
    }

    fn has_attr(span: &Span, key: &str, value: &str) -> bool {
        span.attributes.iter().any(|kv| {
            kv.key == key
                && kv.value.as_ref().and_then(|v| v.value.as_ref())
                    == Some(&any_value::Value::StringValue(value.to_string()))
        })
    }

    #[test]
    fn test_invocation_produces_span_and_metrics() {
        let t = translator();
        let translation = t.translate(&[
            event(
                "2022-10-12T00:00:00.000Z",
                "platform.start",
                json!({"requestId": "r1", "version": "$LATEST"}),
            ),
            event(
                "2022-10-12T00:00:00.100Z",
                "platform.runtimeDone",
                json!({"requestId": "r1", "status": "success", "metrics": {"durationMs": 100.0}}),
            ),
        ]);

        let spans = spans(&translation);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "platform.invoke");
        assert_eq!(spans[0].kind, SpanKind::Server as i32);
        assert_eq!(
            spans[0].end_time_unix_nano - spans[0].start_time_unix_nano,
            100_000_000
        );
        assert!(has_attr(&spans[0], "faas.invocation_id", "r1"));

        let invocations = metric(&translation, "faas.invocations").unwrap();
        assert_eq!(counter_value(invocations), 1);
        assert!(metric(&translation, "faas.invoke_duration").is_some());
        assert!(metric(&translation, "faas.errors").is_none());
        assert!(translation.logs.is_none());
    }

    #[test]
    fn test_runtime_done_outcomes_are_exclusive() {
        let t = translator();
        let translation = t.translate(&[event(
            "2022-10-12T00:00:00Z",
            "platform.runtimeDone",
            json!({"requestId": "r1", "status": "timeout"}),
        )]);

        assert_eq!(counter_value(metric(&translation, "faas.timeouts").unwrap()), 1);
        assert!(metric(&translation, "faas.invocations").is_none());
        assert!(metric(&translation, "faas.errors").is_none());
        // No platform.start was seen, so no span.
        assert!(translation.traces.is_none());
    }

    fn bool_attr(span: &Span, key: &str) -> Option<bool> {
        span.attributes
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| match v.value {
                Some(any_value::Value::BoolValue(b)) => Some(b),
                _ => None,
            })
    }

    #[test]
    fn test_init_pair_emits_init_span() {
        let t = translator();
        let translation = t.translate(&[
            event(
                "2022-10-12T15:04:04Z",
                "platform.initStart",
                json!({"functionName": "f", "initializationType": "on-demand"}),
            ),
            event(
                "2022-10-12T15:04:05Z",
                "platform.initRuntimeDone",
                json!({"status": "success"}),
            ),
        ]);

        let init = spans(&translation);
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "init f");
        assert_eq!(init[0].kind, SpanKind::Internal as i32);
        assert_eq!(bool_attr(&init[0], "faas.coldstart"), Some(true));
        assert_eq!(
            init[0].end_time_unix_nano - init[0].start_time_unix_nano,
            1_000_000_000
        );
        assert_eq!(counter_value(metric(&translation, "faas.coldstarts").unwrap()), 1);

        // The next invocation only yields its own span.
        let next = t.translate(&[
            event("2022-10-12T15:04:06Z", "platform.start", json!({"requestId": "r1"})),
            event(
                "2022-10-12T15:04:07Z",
                "platform.runtimeDone",
                json!({"requestId": "r1", "status": "success"}),
            ),
        ]);
        let names: Vec<String> = spans(&next).into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["platform.invoke"]);
    }

    #[test]
    fn test_failed_init_sets_error_type() {
        let t = translator();
        let translation = t.translate(&[
            event("2022-10-12T00:00:00Z", "platform.initStart", json!({})),
            event(
                "2022-10-12T00:00:01Z",
                "platform.initRuntimeDone",
                json!({"status": "error", "errorType": "Runtime.Unknown"}),
            ),
        ]);

        let spans = spans(&translation);
        assert_eq!(spans.len(), 1);
        assert_eq!(
            spans[0].status.as_ref().map(|s| s.code),
            Some(status::StatusCode::Error as i32)
        );
        assert!(has_attr(&spans[0], "error.type", "Runtime.Unknown"));
    }

    #[test]
    fn test_runtime_done_error_sets_status_message() {
        let t = translator();
        let translation = t.translate(&[
            event("2022-10-12T00:00:00Z", "platform.start", json!({"requestId": "r1"})),
            event(
                "2022-10-12T00:00:00.500Z",
                "platform.runtimeDone",
                json!({"requestId": "r1", "status": "error", "errorType": "Runtime.ExitError"}),
            ),
        ]);

        let spans = spans(&translation);
        assert_eq!(spans.len(), 1);
        let span_status = spans[0].status.as_ref().unwrap();
        assert_eq!(span_status.code, status::StatusCode::Error as i32);
        assert_eq!(span_status.message, "Runtime.ExitError");
        assert_eq!(counter_value(metric(&translation, "faas.errors").unwrap()), 1);
        assert!(metric(&translation, "faas.invocations").is_none());
    }

    #[test]
    fn test_report_records_memory_usage_in_bytes() {
        let translation = translator().translate(&[event(
            "2022-10-12T00:00:00Z",
            "platform.report",
            json!({
                "requestId": "r1",
                "status": "success",
                "metrics": {"durationMs": 10.0, "billedDurationMs": 10, "memorySizeMB": 256, "maxMemoryUsedMB": 128}
            }),
        )]);

        let mem = metric(&translation, "faas.mem_usage").unwrap();
        assert_eq!(mem.unit, "By");
        let Some(Data::Histogram(histogram)) = &mem.data else {
            panic!("not a histogram");
        };
        assert_eq!(histogram.data_points.len(), 1);
        assert_eq!(histogram.data_points[0].count, 1);
        assert_eq!(histogram.data_points[0].sum, Some(128_000_000.0));
    }

    #[test]
    fn test_plain_logs_inherit_current_invocation() {
        let t = translator();
        let translation = t.translate(&[
            event("2022-10-12T00:00:00Z", "platform.start", json!({"requestId": "r1"})),
            event("2022-10-12T00:00:00Z", "function", json!("inside")),
            event(
                "2022-10-12T00:00:01Z",
                "platform.runtimeDone",
                json!({"requestId": "r1", "status": "success"}),
            ),
            event("2022-10-12T00:00:02Z", "function", json!("outside")),
        ]);

        let logs = translation.logs.unwrap();
        let records = &logs.resource_logs[0].scope_logs[0].log_records;
        assert_eq!(records.len(), 2);
        let ids: Vec<bool> = records
            .iter()
            .map(|r| r.attributes.iter().any(|kv| kv.key == "faas.invocation_id"))
            .collect();
        assert_eq!(ids, vec![true, false]);
        assert!(t.current_invocation().is_none());
    }

    #[test]
    fn test_log_report_toggles_platform_logs() {
        let report = event(
            "2022-10-12T00:00:00Z",
            "platform.report",
            json!({"requestId": "r1", "metrics": {"durationMs": 1.0, "maxMemoryUsedMB": 64}}),
        );

        let quiet = translator().translate(std::slice::from_ref(&report));
        assert!(quiet.logs.is_none());
        assert!(metric(&quiet, "faas.mem_usage").is_some());

        let verbose = Translator::builder()
            .resource(Resource::default())
            .log_report(true)
            .build()
            .translate(&[report]);
        let logs = verbose.logs.unwrap();
        assert_eq!(logs.resource_logs[0].scope_logs[0].log_records.len(), 1);
    }

    #[test]
    fn test_signals_carry_scope_and_resource() {
        let resource = Resource {
            attributes: vec![kv_string("service.name", "svc")],
            ..Default::default()
        };
        let t = Translator::builder().resource(resource.clone()).build();
        let translation = t.translate(&[event("2022-10-12T00:00:00Z", "function", json!("x"))]);

        let logs = translation.logs.unwrap();
        assert_eq!(logs.resource_logs[0].resource.as_ref(), Some(&resource));
        assert_eq!(
            logs.resource_logs[0].scope_logs[0].scope.as_ref().unwrap().name,
            SCOPE_NAME
        );
    }

    #[test]
    fn test_into_signals_order() {
        let translation = Translation {
            traces: Some(ExportTraceServiceRequest::default()),
            metrics: None,
            logs: Some(ExportLogsServiceRequest::default()),
        };
        let kinds: Vec<_> = translation.into_signals().iter().map(Signal::kind).collect();
        assert_eq!(
            kinds,
            vec![crate::signal::SignalKind::Traces, crate::signal::SignalKind::Logs]
        );
    }
}
