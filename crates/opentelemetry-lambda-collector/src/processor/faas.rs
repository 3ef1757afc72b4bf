//! Joins the platform's `platform.invoke` span with the function's own
//! invocation span.
//!
//! Both carry `faas.invocation_id`. Whichever arrives first is held back
//! until its partner shows up; the pair is then emitted as one trace with
//! the function span parented by the platform span. The init span tagged
//! with the same id follows the pair into that trace.
//!
//! Spans whose partner never arrives stay cached until shutdown, so this
//! processor only makes sense when the function's instrumentation sets
//! `faas.invocation_id`.

use super::{CachedSpan, bool_attribute, drain_spans, string_attribute};
use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, Processor, ProcessorFactory,
    decode_config,
};
use crate::resource::semconv;
use crate::signal::{
    BoxFuture, ClientInfo, Consumer, ConsumerError, SharedConsumer, Signal, SignalKind,
};
use crate::translator::SCOPE_NAME;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Caches {
    platform_spans: HashMap<String, CachedSpan>,
    init_spans: HashMap<String, CachedSpan>,
    invocation_spans: HashMap<String, CachedSpan>,
}

impl Caches {
    fn len(&self) -> usize {
        self.platform_spans.len() + self.init_spans.len() + self.invocation_spans.len()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FaasConfig {}

/// Span correlation processor for `faas.invocation_id`.
pub struct FaasProcessor {
    id: ComponentId,
    next: SharedConsumer,
    caches: Mutex<Caches>,
}

impl FaasProcessor {
    /// Creates a processor forwarding to `next`.
    pub fn new(id: ComponentId, next: SharedConsumer) -> Self {
        Self {
            id,
            next,
            caches: Mutex::new(Caches::default()),
        }
    }

    /// Returns the number of spans waiting for a partner.
    pub fn cached(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Caches> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, mut request: ExportTraceServiceRequest) -> ExportTraceServiceRequest {
        let held = drain_spans(&mut request, |span| {
            string_attribute(&span.attributes, semconv::FAAS_INVOCATION_ID).is_some()
        });

        let mut caches = self.lock();
        for cached in held {
            let Some(request_id) =
                string_attribute(&cached.span.attributes, semconv::FAAS_INVOCATION_ID)
                    .map(str::to_string)
            else {
                continue;
            };

            let cache = if cached.scope_name() == SCOPE_NAME {
                if bool_attribute(&cached.span.attributes, semconv::FAAS_COLDSTART).is_some() {
                    &mut caches.init_spans
                } else {
                    &mut caches.platform_spans
                }
            } else {
                &mut caches.invocation_spans
            };
            cache.insert(request_id, cached);
        }

        let mut matched: Vec<String> = caches
            .platform_spans
            .keys()
            .filter(|id| caches.invocation_spans.contains_key(*id))
            .cloned()
            .collect();
        matched.sort();

        for request_id in matched {
            let (Some(mut platform), Some(mut invocation)) = (
                caches.platform_spans.remove(&request_id),
                caches.invocation_spans.remove(&request_id),
            ) else {
                continue;
            };

            platform.span.parent_span_id = invocation.span.parent_span_id.clone();
            platform.span.trace_id = invocation.span.trace_id.clone();
            invocation.span.parent_span_id = platform.span.span_id.clone();

            let trace_id = invocation.span.trace_id.clone();
            request.resource_spans.push(platform.into_resource_spans());
            request.resource_spans.push(invocation.into_resource_spans());

            if let Some(mut init) = caches.init_spans.remove(&request_id) {
                init.span.trace_id = trace_id;
                request.resource_spans.push(init.into_resource_spans());
            }

            tracing::debug!(processor = %self.id, %request_id, "Correlated invocation spans");
        }

        request
    }

    fn drain(&self) -> ExportTraceServiceRequest {
        let mut guard = self.lock();
        let caches = &mut *guard;
        let mut held: Vec<(String, CachedSpan)> = caches
            .platform_spans
            .drain()
            .chain(caches.init_spans.drain())
            .chain(caches.invocation_spans.drain())
            .collect();
        held.sort_by(|a, b| a.0.cmp(&b.0));

        ExportTraceServiceRequest {
            resource_spans: held
                .into_iter()
                .map(|(_, cached)| cached.into_resource_spans())
                .collect(),
        }
    }
}

impl Consumer for FaasProcessor {
    fn consume(&self, info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(async move {
            let request = match signal {
                Signal::Traces(request) => self.process(request),
                other => return self.next.consume(info, other).await,
            };
            if request.resource_spans.is_empty() {
                return Ok(());
            }
            self.next.consume(info, Signal::Traces(request)).await
        })
    }
}

impl Component for FaasProcessor {
    fn shutdown(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            let request = self.drain();
            if request.resource_spans.is_empty() {
                return Ok(());
            }

            tracing::debug!(
                processor = %self.id,
                spans = request.resource_spans.len(),
                "Flushing uncorrelated spans"
            );
            if let Err(error) = self
                .next
                .consume(ClientInfo::default(), Signal::Traces(request))
                .await
            {
                tracing::error!(processor = %self.id, %error, "Failed to flush uncorrelated spans");
            }
            Ok(())
        })
    }
}

impl Processor for FaasProcessor {}

/// Factory for `faas`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaasProcessorFactory;

impl ProcessorFactory for FaasProcessorFactory {
    fn type_name(&self) -> &'static str {
        "faas"
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
        let _: FaasConfig = decode_config(id, config)?;
        Ok(Arc::new(FaasProcessor::new(id.clone(), next)))
    }
}
