//! Pipeline component model.
//!
//! Every receiver, processor, exporter and extension is created by a
//! factory from its [`ComponentId`], its YAML subtree and a shared
//! [`BuildContext`]. The context carries the lifecycle [`Notifier`], so a
//! component that needs invocation boundaries registers itself while it is
//! built instead of reaching for process-wide state.

use crate::exporter::ExportError;
use crate::extension_api::ApiError;
use crate::lifecycle::Notifier;
use crate::listener::ListenerError;
use crate::processor::ProcessorError;
use crate::signal::{BoxFuture, Consumer, SharedConsumer, SignalKind, SignalRouter};
use crate::translator::Temporality;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Errors from building, starting or stopping a component.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// An id is not `type` or `type/name`.
    #[error("invalid component id {0:?}")]
    InvalidId(String),

    /// The component's config subtree did not deserialize.
    #[error("invalid config for {id}")]
    Config {
        /// Component id.
        id: ComponentId,
        /// Underlying error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The config deserialized but holds an unusable value.
    #[error("invalid config for {id}: {reason}")]
    Invalid {
        /// Component id.
        id: ComponentId,
        /// What is wrong.
        reason: String,
    },

    /// A processor could not be built.
    #[error("processor {id} failed")]
    Processor {
        /// Component id.
        id: ComponentId,
        /// Underlying error.
        #[source]
        source: ProcessorError,
    },

    /// A listener failed to start.
    #[error("{id} failed to listen")]
    Listener {
        /// Component id.
        id: ComponentId,
        /// Underlying error.
        #[source]
        source: ListenerError,
    },

    /// A call to the Lambda host failed.
    #[error("{id} failed to call the Lambda host")]
    Api {
        /// Component id.
        id: ComponentId,
        /// Underlying error.
        #[source]
        source: ApiError,
    },

    /// An exporter could not be built.
    #[error("exporter {id} failed")]
    Exporter {
        /// Component id.
        id: ComponentId,
        /// Underlying error.
        #[source]
        source: ExportError,
    },
}

/// Identifies a configured component: `type` or `type/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    type_name: String,
    name: Option<String>,
}

impl ComponentId {
    /// Creates an id with no name part.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: None,
        }
    }

    /// Creates a `type/name` id.
    pub fn with_name(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: Some(name.into()),
        }
    }

    /// Parses `type` or `type/name`.
    pub fn parse(id: &str) -> Result<Self, ComponentError> {
        let invalid = || ComponentError::InvalidId(id.to_string());
        match id.split_once('/') {
            None if !id.trim().is_empty() => Ok(Self::new(id.trim())),
            Some((type_name, name)) if !type_name.trim().is_empty() && !name.trim().is_empty() => {
                Ok(Self::with_name(type_name.trim(), name.trim()))
            }
            _ => Err(invalid()),
        }
    }

    /// The component type, which selects the factory.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The optional instance name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.type_name, name),
            None => f.write_str(&self.type_name),
        }
    }
}

/// What the extension learned from the Lambda host, for components that
/// talk to it.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    /// `AWS_LAMBDA_RUNTIME_API`.
    pub runtime_api: Option<String>,
    /// Identifier returned by `register`.
    pub extension_id: Option<String>,
    /// Running under `sam local`.
    pub sam_local: bool,
    /// Value for `service.instance.id`.
    pub service_instance_id: Option<String>,
    /// Temporality preference from the environment.
    pub metrics_temporality: Option<Temporality>,
}

/// Shared inputs for every factory.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Lifecycle notifier. Components that follow invocation boundaries
    /// fail to build without one.
    pub notifier: Option<Notifier>,
    /// Lambda host details.
    pub host: HostContext,
}

impl BuildContext {
    /// A context with the given notifier.
    pub fn new(notifier: Notifier) -> Self {
        Self {
            notifier: Some(notifier),
            host: HostContext::default(),
        }
    }

    /// Sets the host details.
    pub fn with_host(mut self, host: HostContext) -> Self {
        self.host = host;
        self
    }
}

/// Start and stop hooks shared by every component.
pub trait Component: Send + Sync {
    /// Starts background work. Called once, downstream components first.
    fn start(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async { Ok(()) })
    }

    /// Flushes and stops. Must tolerate being called without `start`.
    fn shutdown(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async { Ok(()) })
    }
}

/// A pipeline stage between receivers and exporters.
pub trait Processor: Consumer + Component {}

/// A pipeline sink.
pub trait Exporter: Consumer + Component {}

/// Creates receivers.
pub trait ReceiverFactory: Send + Sync {
    /// Component type handled by this factory.
    fn type_name(&self) -> &'static str;
    /// Signals the receiver can produce.
    fn signals(&self) -> &'static [SignalKind];
    /// Builds a receiver that delivers into `next`.
    fn create(
        &self,
        ctx: &BuildContext,
        id: &ComponentId,
        config: &Value,
        next: SignalRouter,
    ) -> Result<Arc<dyn Component>, ComponentError>;
}

/// Creates processors. One instance is built per pipeline.
pub trait ProcessorFactory: Send + Sync {
    /// Component type handled by this factory.
    fn type_name(&self) -> &'static str;
    /// Signals the processor accepts.
    fn signals(&self) -> &'static [SignalKind];
    /// Builds a processor for a pipeline of `kind` that forwards to `next`.
    fn create(
        &self,
        ctx: &BuildContext,
        id: &ComponentId,
        config: &Value,
        kind: SignalKind,
        next: SharedConsumer,
    ) -> Result<Arc<dyn Processor>, ComponentError>;
}

/// Creates exporters. One instance is shared by every pipeline using it.
pub trait ExporterFactory: Send + Sync {
    /// Component type handled by this factory.
    fn type_name(&self) -> &'static str;
    /// Signals the exporter accepts.
    fn signals(&self) -> &'static [SignalKind];
    /// Builds the exporter.
    fn create(
        &self,
        ctx: &BuildContext,
        id: &ComponentId,
        config: &Value,
    ) -> Result<Arc<dyn Exporter>, ComponentError>;
}

/// Creates extensions.
pub trait ExtensionFactory: Send + Sync {
    /// Component type handled by this factory.
    fn type_name(&self) -> &'static str;
    /// Builds the extension.
    fn create(
        &self,
        ctx: &BuildContext,
        id: &ComponentId,
        config: &Value,
    ) -> Result<Arc<dyn Component>, ComponentError>;
}

/// Factories by component type.
#[derive(Clone, Default)]
pub struct Factories {
    /// Receiver factories.
    pub receivers: BTreeMap<&'static str, Arc<dyn ReceiverFactory>>,
    /// Processor factories.
    pub processors: BTreeMap<&'static str, Arc<dyn ProcessorFactory>>,
    /// Exporter factories.
    pub exporters: BTreeMap<&'static str, Arc<dyn ExporterFactory>>,
    /// Extension factories.
    pub extensions: BTreeMap<&'static str, Arc<dyn ExtensionFactory>>,
}

impl Factories {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in receivers, processors and exporters.
    pub fn builtin() -> Self {
        use crate::exporter::{DebugExporterFactory, OtlpHttpExporterFactory};
        use crate::processor::{
            BatchProcessorFactory, ColdstartProcessorFactory, DecoupleProcessorFactory,
            FaasProcessorFactory, ResourceProcessorFactory,
        };
        use crate::receiver::{OtlpReceiverFactory, TelemetryReceiverFactory};

        Self::new()
            .with_receiver(TelemetryReceiverFactory::combined())
            .with_receiver(TelemetryReceiverFactory::logs_only())
            .with_receiver(OtlpReceiverFactory)
            .with_processor(DecoupleProcessorFactory)
            .with_processor(FaasProcessorFactory)
            .with_processor(ColdstartProcessorFactory)
            .with_processor(BatchProcessorFactory)
            .with_processor(ResourceProcessorFactory)
            .with_exporter(OtlpHttpExporterFactory::new("otlphttp"))
            .with_exporter(OtlpHttpExporterFactory::new("otlp"))
            .with_exporter(DebugExporterFactory)
    }

    /// Registers a receiver factory.
    pub fn with_receiver(mut self, factory: impl ReceiverFactory + 'static) -> Self {
        self.receivers.insert(factory.type_name(), Arc::new(factory));
        self
    }

    /// Registers a processor factory.
    pub fn with_processor(mut self, factory: impl ProcessorFactory + 'static) -> Self {
        self.processors.insert(factory.type_name(), Arc::new(factory));
        self
    }

    /// Registers an exporter factory.
    pub fn with_exporter(mut self, factory: impl ExporterFactory + 'static) -> Self {
        self.exporters.insert(factory.type_name(), Arc::new(factory));
        self
    }

    /// Registers an extension factory.
    pub fn with_extension(mut self, factory: impl ExtensionFactory + 'static) -> Self {
        self.extensions.insert(factory.type_name(), Arc::new(factory));
        self
    }
}

impl fmt::Debug for Factories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factories")
            .field("receivers", &self.receivers.keys().collect::<Vec<_>>())
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("exporters", &self.exporters.keys().collect::<Vec<_>>())
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Deserializes a component config. A missing or null subtree yields the
/// default config.
pub fn decode_config<T>(id: &ComponentId, config: &Value) -> Result<T, ComponentError>
where
    T: DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(config.clone()).map_err(|source| ComponentError::Config {
        id: id.clone(),
        source,
    })
}
