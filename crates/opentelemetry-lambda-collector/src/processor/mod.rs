//! Built-in processors.
//!
//! | Type | Signals | Purpose |
//! |------|---------|---------|
//! | `decouple` | all | queue released only at invocation boundaries |
//! | `faas` | traces | join platform and function invocation spans |
//! | `coldstart` | traces | attach the cold-start span to the first invocation |
//! | `batch` | all | group payloads by size or time |
//! | `resource` | all | edit resource attributes |

mod batch;
mod coldstart;
mod decouple;
mod faas;
mod resource;

pub use batch::{BatchConfig, BatchProcessor, BatchProcessorFactory};
pub use coldstart::{ColdstartProcessor, ColdstartProcessorFactory};
pub use decouple::{
    DEFAULT_MAX_QUEUE_SIZE, DecoupleConfig, DecoupleProcessor, DecoupleProcessorFactory,
};
pub use faas::{FaasProcessor, FaasProcessorFactory};
pub use resource::{
    AttributeAction, AttributeEdit, ResourceConfig, ResourceProcessor, ResourceProcessorFactory,
};

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{InstrumentationScope, KeyValue, any_value};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};

/// Errors from building a processor.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The build context carries no lifecycle notifier.
    #[error("no lifecycle notifier available")]
    NoLifecycleNotifier,

    /// A queue was configured with zero capacity.
    #[error("queue size must be at least 1")]
    InvalidQueueSize,

    /// The processor does not handle the pipeline's signal.
    #[error("signal {0} is not supported")]
    UnsupportedSignal(crate::signal::SignalKind),
}

pub(crate) fn attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a any_value::Value> {
    attributes
        .iter()
        .find(|kv| kv.key == key)
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| v.value.as_ref())
}

pub(crate) fn string_attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a str> {
    match attribute(attributes, key)? {
        any_value::Value::StringValue(s) => Some(s),
        _ => None,
    }
}

pub(crate) fn bool_attribute(attributes: &[KeyValue], key: &str) -> Option<bool> {
    match attribute(attributes, key)? {
        any_value::Value::BoolValue(b) => Some(*b),
        _ => None,
    }
}

/// A span held back together with the resource and scope it arrived under.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CachedSpan {
    resource: Option<Resource>,
    resource_schema_url: String,
    scope: Option<InstrumentationScope>,
    scope_schema_url: String,
    span: Span,
}

impl CachedSpan {
    fn scope_name(&self) -> &str {
        self.scope.as_ref().map(|s| s.name.as_str()).unwrap_or_default()
    }

    fn into_resource_spans(self) -> ResourceSpans {
        ResourceSpans {
            resource: self.resource,
            scope_spans: vec![ScopeSpans {
                scope: self.scope,
                spans: vec![self.span],
                schema_url: self.scope_schema_url,
            }],
            schema_url: self.resource_schema_url,
        }
    }
}

/// Removes every span matching `take` from `request`, dropping emptied
/// scope and resource entries.
pub(crate) fn drain_spans<F>(request: &mut ExportTraceServiceRequest, mut take: F) -> Vec<CachedSpan>
where
    F: FnMut(&Span) -> bool,
{
    let mut taken = Vec::new();

    for resource_spans in &mut request.resource_spans {
        for scope_spans in &mut resource_spans.scope_spans {
            let (matched, kept): (Vec<Span>, Vec<Span>) =
                std::mem::take(&mut scope_spans.spans).into_iter().partition(|s| take(s));
            scope_spans.spans = kept;

            taken.extend(matched.into_iter().map(|span| CachedSpan {
                resource: resource_spans.resource.clone(),
                resource_schema_url: resource_spans.schema_url.clone(),
                scope: scope_spans.scope.clone(),
                scope_schema_url: scope_spans.schema_url.clone(),
                span,
            }));
        }
    }

    prune(request);
    taken
}

/// Drops scope and resource entries left without spans.
pub(crate) fn prune(request: &mut ExportTraceServiceRequest) {
    for resource_spans in &mut request.resource_spans {
        resource_spans.scope_spans.retain(|ss| !ss.spans.is_empty());
    }
    request.resource_spans.retain(|rs| !rs.scope_spans.is_empty());
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::signal::{BoxFuture, ClientInfo, Consumer, ConsumerError, Signal};
    use opentelemetry_proto::tonic::common::v1::AnyValue;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct Recorder(pub Mutex<Vec<Signal>>);

    impl Recorder {
        pub(crate) fn spans(&self) -> Vec<Span> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|s| match s {
                    Signal::Traces(req) => Some(req.clone()),
                    _ => None,
                })
                .flat_map(|req| req.resource_spans)
                .flat_map(|rs| rs.scope_spans)
                .flat_map(|ss| ss.spans)
                .collect()
        }
    }

    impl Consumer for Recorder {
        fn consume(
            &self,
            _info: ClientInfo,
            signal: Signal,
        ) -> BoxFuture<'_, Result<(), ConsumerError>> {
            self.0.lock().unwrap().push(signal);
            Box::pin(async { Ok(()) })
        }
    }

    pub(crate) fn string_kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    pub(crate) fn bool_kv(key: &str, value: bool) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::BoolValue(value)),
            }),
        }
    }

    pub(crate) fn span(name: &str, trace: u8, id: u8, parent: Option<u8>, attributes: Vec<KeyValue>) -> Span {
        Span {
            name: name.to_string(),
            trace_id: vec![trace; 16],
            span_id: vec![id; 8],
            parent_span_id: parent.map(|p| vec![p; 8]).unwrap_or_default(),
            attributes,
            ..Default::default()
        }
    }

    pub(crate) fn traces(scope: &str, spans: Vec<Span>) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: scope.to_string(),
                        ..Default::default()
                    }),
                    spans,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }
}
