//! Attaches the cold-start span to the first invocation's trace.
//!
//! The span marked `faas.coldstart=true` and the first span of the first
//! invocation can arrive in either order. Whichever comes first is
//! remembered; once both have been seen the cold-start span is emitted as a
//! child of the invocation span and the processor becomes a pass-through.

use super::{CachedSpan, bool_attribute, prune, string_attribute};
use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, Processor, ProcessorFactory,
    decode_config,
};
use crate::resource::semconv;
use crate::signal::{
    BoxFuture, ClientInfo, Consumer, ConsumerError, SharedConsumer, Signal, SignalKind,
};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::trace::v1::Span;
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq)]
struct Execution {
    trace_id: Vec<u8>,
    span_id: Vec<u8>,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    SawColdstart(Box<CachedSpan>),
    SawExecution(Execution),
    Reported,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ColdstartConfig {}

fn is_coldstart(span: &Span) -> bool {
    bool_attribute(&span.attributes, semconv::FAAS_COLDSTART) == Some(true)
}

fn is_execution(span: &Span) -> bool {
    string_attribute(&span.attributes, semconv::FAAS_EXECUTION).is_some()
        || string_attribute(&span.attributes, semconv::FAAS_INVOCATION_ID).is_some()
}

/// One-shot cold-start correlation processor.
pub struct ColdstartProcessor {
    id: ComponentId,
    next: SharedConsumer,
    state: Mutex<State>,
}

impl ColdstartProcessor {
    /// Creates a processor forwarding to `next`.
    pub fn new(id: ComponentId, next: SharedConsumer) -> Self {
        Self {
            id,
            next,
            state: Mutex::new(State::Idle),
        }
    }

    /// Returns true once the cold start has been attached to an invocation.
    pub fn reported(&self) -> bool {
        matches!(*self.lock(), State::Reported)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, request: &mut ExportTraceServiceRequest) {
        let mut state = self.lock();
        if matches!(*state, State::Reported) {
            return;
        }

        for resource_spans in &mut request.resource_spans {
            for scope_spans in &mut resource_spans.scope_spans {
                let spans = std::mem::take(&mut scope_spans.spans);
                let mut kept = Vec::with_capacity(spans.len() + 1);

                for mut span in spans {
                    match std::mem::take(&mut *state) {
                        State::Reported => {
                            *state = State::Reported;
                        }
                        State::Idle if is_coldstart(&span) => {
                            *state = State::SawColdstart(Box::new(CachedSpan {
                                resource: resource_spans.resource.clone(),
                                resource_schema_url: resource_spans.schema_url.clone(),
                                scope: scope_spans.scope.clone(),
                                scope_schema_url: scope_spans.schema_url.clone(),
                                span,
                            }));
                            continue;
                        }
                        State::Idle if is_execution(&span) => {
                            *state = State::SawExecution(Execution {
                                trace_id: span.trace_id.clone(),
                                span_id: span.span_id.clone(),
                            });
                        }
                        State::SawExecution(execution) if is_coldstart(&span) => {
                            span.trace_id = execution.trace_id;
                            span.parent_span_id = execution.span_id;
                            *state = State::Reported;
                            tracing::debug!(processor = %self.id, "Cold start attached to invocation");
                        }
                        State::SawColdstart(cached) if is_execution(&span) => {
                            let mut coldstart = cached.span;
                            coldstart.trace_id = span.trace_id.clone();
                            coldstart.parent_span_id = span.span_id.clone();
                            kept.push(span);
                            kept.push(coldstart);
                            *state = State::Reported;
                            tracing::debug!(processor = %self.id, "Cold start attached to invocation");
                            continue;
                        }
                        other => *state = other,
                    }
                    kept.push(span);
                }

                scope_spans.spans = kept;
            }
        }

        prune(request);
    }
}

impl Consumer for ColdstartProcessor {
    fn consume(&self, info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(async move {
            let Signal::Traces(mut request) = signal else {
                return self.next.consume(info, signal).await;
            };
            self.process(&mut request);
            if request.resource_spans.is_empty() {
                return Ok(());
            }
            self.next.consume(info, Signal::Traces(request)).await
        })
    }
}

impl Component for ColdstartProcessor {
    fn shutdown(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            let cached = match std::mem::replace(&mut *self.lock(), State::Reported) {
                State::SawColdstart(cached) => *cached,
                _ => return Ok(()),
            };

            let request = ExportTraceServiceRequest {
                resource_spans: vec![cached.into_resource_spans()],
            };
            if let Err(error) = self
                .next
                .consume(ClientInfo::default(), Signal::Traces(request))
                .await
            {
                tracing::error!(processor = %self.id, %error, "Failed to flush cold start span");
            }
            Ok(())
        })
    }
}

impl Processor for ColdstartProcessor {}

/// Factory for `coldstart`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColdstartProcessorFactory;

impl ProcessorFactory for ColdstartProcessorFactory {
    fn type_name(&self) -> &'static str {
        "coldstart"
    }

    fn signals(&self) -> &'static [SignalKind] {
        &[SignalKind::Traces]
    }

    fn create(
        &self,
        _ctx: &BuildContext,
        id: &ComponentId,
        config: &serde_yaml::Value,
        _kind: SignalKind,
        next: SharedConsumer,
    ) -> Result<Arc<dyn Processor>, ComponentError> {
        let _: ColdstartConfig = decode_config(id, config)?;
        Ok(Arc::new(ColdstartProcessor::new(id.clone(), next)))
    }
}
