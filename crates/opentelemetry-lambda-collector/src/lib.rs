//! OpenTelemetry collector running as an AWS Lambda extension.
//!
//! The extension registers with the Lambda Extensions API, subscribes to the
//! Telemetry API, and runs a pipeline of receivers, processors and exporters
//! described by a YAML config. Platform events become OTLP spans, metrics
//! and logs; the function's own OTLP data is joined to the platform's
//! invocation spans; and the decouple processor keeps exports off the
//! invocation's critical path while making sure nothing is left queued when
//! the sandbox freezes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod component;
pub mod config;
pub mod confmap;
pub mod converter;
pub mod error;
pub mod event;
pub mod exporter;
pub mod extension_api;
pub mod lifecycle;
pub mod listener;
pub mod manager;
pub mod pipeline;
pub mod processor;
pub mod receiver;
pub mod resource;
pub mod signal;
pub mod telemetry_api;
pub mod trace_context;
pub mod translator;

pub use component::{BuildContext, ComponentError, ComponentId, Factories, HostContext};
pub use config::{ConfigError, InitType, Settings};
pub use confmap::{ConfMap, ConfMapError};
pub use converter::{
    AccountIdProcessor, ConvertError, Converter, DecoupleAfterBatch, DisableQueuedRetry,
    ExtensionInjection,
};
pub use error::{CollectorError, Result};
pub use event::{Event, EventType};
pub use exporter::{DebugExporter, ExportError, OtlpHttpConfig, OtlpHttpExporter};
pub use extension_api::{ApiError, EventKind, ExtensionClient, NextEvent, RegisterResponse};
pub use lifecycle::{LifecycleEvent, LifecycleListener, Notifier};
pub use listener::{EventSink, Listener, ListenerError};
pub use manager::Manager;
pub use pipeline::{Pipeline, PipelineError, PipelineState};
pub use processor::{DecoupleProcessor, ProcessorError};
pub use receiver::{OtlpReceiver, TelemetryReceiver};
pub use resource::detect_resource;
pub use signal::{ClientInfo, Consumer, ConsumerError, SharedConsumer, Signal, SignalKind, SignalRouter};
pub use telemetry_api::{TelemetryApiClient, TelemetrySubscription, TelemetryType};
pub use trace_context::TraceContext;
pub use translator::{Temporality, Translator};
