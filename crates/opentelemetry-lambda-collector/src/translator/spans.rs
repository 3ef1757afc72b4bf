//! Platform span synthesis.

use super::{kv_bool, kv_string};
use crate::event::Status;
use crate::resource::semconv;
use crate::trace_context::{TraceContext, generate_span_id, generate_trace_id};
use opentelemetry_proto::tonic::trace::v1::{Span, Status as SpanStatus, span::SpanKind, status};

/// Name of the span covering one invocation.
pub const INVOKE_SPAN_NAME: &str = "platform.invoke";

/// Open init phase, waiting for `platform.initRuntimeDone`.
#[derive(Debug, Clone)]
pub(crate) struct InitPhase {
    pub(crate) start_time: u64,
    pub(crate) function_name: String,
}

/// Open invocation, waiting for `platform.runtimeDone`.
#[derive(Debug, Clone)]
pub(crate) struct InvocationPhase {
    pub(crate) start_time: u64,
    pub(crate) context: Option<TraceContext>,
}

/// Builds the `init <function>` span.
pub(crate) fn init_span(
    phase: &InitPhase,
    end_time: u64,
    status: &Status,
    error_type: Option<&str>,
) -> Span {
    let mut attributes = vec![kv_bool(semconv::FAAS_COLDSTART, true)];
    let mut span_status = SpanStatus::default();

    if status.is_error() || *status == Status::Timeout {
        span_status.code = status::StatusCode::Error as i32;
        if let Some(error_type) = error_type {
            attributes.push(kv_string(semconv::ERROR_TYPE, error_type));
        }
    }

    Span {
        trace_id: generate_trace_id(),
        span_id: generate_span_id(),
        name: format!("init {}", phase.function_name),
        kind: SpanKind::Internal as i32,
        start_time_unix_nano: phase.start_time,
        end_time_unix_nano: end_time,
        attributes,
        status: Some(span_status),
        ..Default::default()
    }
}

/// Builds the `platform.invoke` span.
///
/// An X-Ray context from `platform.start` supplies the trace id and parent.
pub(crate) fn invoke_span(
    request_id: &str,
    phase: &InvocationPhase,
    end_time: u64,
    status: &Status,
    error_type: Option<&str>,
) -> Span {
    let (trace_id, parent_span_id) = match phase.context {
        Some(ctx) => (ctx.trace_id.to_vec(), ctx.span_id.to_vec()),
        None => (generate_trace_id(), Vec::new()),
    };

    let span_status = match status {
        Status::Success => SpanStatus::default(),
        Status::Failure | Status::Error | Status::Timeout => SpanStatus {
            code: status::StatusCode::Error as i32,
            message: error_type.map(str::to_string).unwrap_or_else(|| status_str(status)),
        },
        Status::Other(_) => SpanStatus::default(),
    };

    Span {
        trace_id,
        span_id: generate_span_id(),
        parent_span_id,
        name: INVOKE_SPAN_NAME.to_string(),
        kind: SpanKind::Server as i32,
        start_time_unix_nano: phase.start_time,
        end_time_unix_nano: end_time,
        attributes: vec![kv_string(semconv::FAAS_INVOCATION_ID, request_id)],
        status: Some(span_status),
        ..Default::default()
    }
}

fn status_str(status: &Status) -> String {
    match status {
        Status::Success => "success".to_string(),
        Status::Failure => "failure".to_string(),
        Status::Error => "error".to_string(),
        Status::Timeout => "timeout".to_string(),
        Status::Other(s) => s.clone(),
    }
}
