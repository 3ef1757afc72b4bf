//! Builds and runs the receiver → processor → exporter graph.
//!
//! The graph is described by the `service` section of the pipeline config:
//!
//! ```yaml
//! service:
//!   extensions: []
//!   pipelines:
//!     traces:
//!       receivers: [telemetryapi]
//!       processors: [batch, decouple]
//!       exporters: [otlphttp]
//! ```
//!
//! Receivers and exporters are built once and shared by every pipeline
//! listing them; processors are built once per pipeline. The graph runs on a
//! background task whose progress is published as a [`PipelineState`].

use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, Exporter, Factories, Processor,
};
use crate::confmap::{ConfMap, ConfMapError};
use crate::signal::{SharedConsumer, SignalKind, SignalRouter};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Observable pipeline state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Built or starting components.
    Starting,
    /// Every component started.
    Running,
    /// Shutting components down.
    Closing,
    /// Stopped.
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Closing => "closing",
            PipelineState::Closed => "closed",
        })
    }
}

/// Errors from validating, building or running the pipeline graph.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The `service` section did not decode.
    #[error("invalid service section")]
    Config(#[from] ConfMapError),

    /// `service.pipelines` is empty.
    #[error("no pipelines configured")]
    NoPipelines,

    /// A pipeline name does not start with `traces`, `metrics` or `logs`.
    #[error("pipeline {0:?} is not a traces, metrics or logs pipeline")]
    InvalidPipelineName(String),

    /// A pipeline lists no receivers or no exporters.
    #[error("pipeline {pipeline} has no {section}")]
    EmptyPipeline {
        /// Pipeline name.
        pipeline: String,
        /// `receivers` or `exporters`.
        section: &'static str,
    },

    /// A referenced component has no config entry.
    #[error("{section} {id} referenced by {referrer} is not configured")]
    UndefinedComponent {
        /// Top-level section searched.
        section: &'static str,
        /// Referenced id.
        id: String,
        /// Pipeline name or `service`.
        referrer: String,
    },

    /// No factory exists for a component type.
    #[error("unknown {section} type {type_name:?} for {id}")]
    UnknownType {
        /// Top-level section.
        section: &'static str,
        /// Component type.
        type_name: String,
        /// Component id.
        id: String,
    },

    /// A component cannot handle the pipeline's signal.
    #[error("{id} does not support {signal} (pipeline {pipeline})")]
    UnsupportedSignal {
        /// Component id.
        id: String,
        /// Pipeline name.
        pipeline: String,
        /// Pipeline signal.
        signal: SignalKind,
    },

    /// A component failed to build, start or stop.
    #[error(transparent)]
    Component(#[from] ComponentError),

    /// `start` observed a state other than starting or running.
    #[error("pipeline is {0}")]
    UnexpectedState(PipelineState),

    /// `start` was cancelled.
    #[error("pipeline start was cancelled")]
    Cancelled,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PipelineSpec {
    receivers: Vec<String>,
    processors: Vec<String>,
    exporters: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceSpec {
    extensions: Vec<String>,
    pipelines: BTreeMap<String, PipelineSpec>,
}

fn pipeline_kind(name: &str) -> Result<SignalKind, PipelineError> {
    let base = name.split_once('/').map_or(name, |(base, _)| base);
    SignalKind::parse(base).ok_or_else(|| PipelineError::InvalidPipelineName(name.to_string()))
}

fn component_config<'a>(
    conf: &'a ConfMap,
    section: &'static str,
    id: &str,
    referrer: &str,
) -> Result<&'a Value, PipelineError> {
    conf.get_mapping(section)
        .and_then(|m| m.get(id))
        .ok_or_else(|| PipelineError::UndefinedComponent {
            section,
            id: id.to_string(),
            referrer: referrer.to_string(),
        })
}

fn unknown(section: &'static str, id: &ComponentId) -> PipelineError {
    PipelineError::UnknownType {
        section,
        type_name: id.type_name().to_string(),
        id: id.to_string(),
    }
}

fn check_signal(
    signals: &[SignalKind],
    id: &ComponentId,
    pipeline: &str,
    signal: SignalKind,
) -> Result<(), PipelineError> {
    if signals.contains(&signal) {
        Ok(())
    } else {
        Err(PipelineError::UnsupportedSignal {
            id: id.to_string(),
            pipeline: pipeline.to_string(),
            signal,
        })
    }
}

/// Built components in start order.
#[derive(Default)]
struct Graph {
    extensions: Vec<(ComponentId, Arc<dyn Component>)>,
    exporters: Vec<(ComponentId, Arc<dyn Exporter>)>,
    /// Upstream first within each pipeline.
    processors: Vec<(ComponentId, Arc<dyn Processor>)>,
    receivers: Vec<(ComponentId, Arc<dyn Component>)>,
}

impl Graph {
    async fn start(&self) -> Result<(), PipelineError> {
        for (id, extension) in &self.extensions {
            tracing::debug!(extension = %id, "Starting extension");
            extension.start().await?;
        }
        for (id, exporter) in &self.exporters {
            tracing::debug!(exporter = %id, "Starting exporter");
            exporter.start().await?;
        }
        for (id, processor) in self.processors.iter().rev() {
            tracing::debug!(processor = %id, "Starting processor");
            processor.start().await?;
        }
        for (id, receiver) in &self.receivers {
            tracing::debug!(receiver = %id, "Starting receiver");
            receiver.start().await?;
        }
        Ok(())
    }

    /// Stops receivers, then processors, then exporters, then extensions.
    /// Every component is stopped; the first error is returned.
    async fn shutdown(&self) -> Result<(), PipelineError> {
        let mut first_error = None;
        let mut record = |result: Result<(), ComponentError>| {
            if let Err(error) = result {
                tracing::error!(%error, "Component failed to shut down");
                first_error.get_or_insert(error);
            }
        };

        for (_, receiver) in &self.receivers {
            record(receiver.shutdown().await);
        }
        for (_, processor) in &self.processors {
            record(processor.shutdown().await);
        }
        for (_, exporter) in &self.exporters {
            record(exporter.shutdown().await);
        }
        for (_, extension) in &self.extensions {
            record(extension.shutdown().await);
        }

        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

/// A built pipeline graph and its runner.
pub struct Pipeline {
    graph: Arc<Graph>,
    names: Vec<String>,
    state: Arc<watch::Sender<PipelineState>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), PipelineError>>>>,
}

impl Pipeline {
    /// Validates `conf` and builds every component it references.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid pipeline name, a reference to an
    /// undefined component, an unknown component type, a component that
    /// cannot handle its pipeline's signal, or a factory failure.
    pub fn build(
        conf: &ConfMap,
        factories: &Factories,
        ctx: &BuildContext,
    ) -> Result<Self, PipelineError> {
        let service: ServiceSpec = match conf.get("service") {
            Some(value) if !value.is_null() => conf.decode("service")?,
            _ => ServiceSpec::default(),
        };
        if service.pipelines.is_empty() {
            return Err(PipelineError::NoPipelines);
        }

        let mut pipelines = Vec::with_capacity(service.pipelines.len());
        for (name, spec) in &service.pipelines {
            let kind = pipeline_kind(name)?;
            if spec.receivers.is_empty() {
                return Err(PipelineError::EmptyPipeline {
                    pipeline: name.clone(),
                    section: "receivers",
                });
            }
            if spec.exporters.is_empty() {
                return Err(PipelineError::EmptyPipeline {
                    pipeline: name.clone(),
                    section: "exporters",
                });
            }
            pipelines.push((name.as_str(), kind, spec));
        }

        let mut graph = Graph::default();

        for raw in &service.extensions {
            let config = component_config(conf, "extensions", raw, "service")?;
            let id = ComponentId::parse(raw)?;
            let factory = factories
                .extensions
                .get(id.type_name())
                .ok_or_else(|| unknown("extension", &id))?;
            graph.extensions.push((id.clone(), factory.create(ctx, &id, config)?));
        }

        let mut exporters: BTreeMap<&str, Arc<dyn Exporter>> = BTreeMap::new();
        for (name, kind, spec) in &pipelines {
            for raw in &spec.exporters {
                let config = component_config(conf, "exporters", raw, name)?;
                let id = ComponentId::parse(raw)?;
                let factory = factories
                    .exporters
                    .get(id.type_name())
                    .ok_or_else(|| unknown("exporter", &id))?;
                check_signal(factory.signals(), &id, name, *kind)?;
                if !exporters.contains_key(raw.as_str()) {
                    let exporter = factory.create(ctx, &id, config)?;
                    graph.exporters.push((id, exporter.clone()));
                    exporters.insert(raw.as_str(), exporter);
                }
            }
        }

        let mut receiver_routes: BTreeMap<&str, (ComponentId, SignalRouter)> = BTreeMap::new();
        for (name, kind, spec) in &pipelines {
            let mut fan_out = SignalRouter::new();
            for raw in &spec.exporters {
                if let Some(exporter) = exporters.get(raw.as_str()) {
                    fan_out.add_route(*kind, exporter.clone());
                }
            }
            let mut next: SharedConsumer = Arc::new(fan_out);

            let mut built = Vec::with_capacity(spec.processors.len());
            for raw in spec.processors.iter().rev() {
                let config = component_config(conf, "processors", raw, name)?;
                let id = ComponentId::parse(raw)?;
                let factory = factories
                    .processors
                    .get(id.type_name())
                    .ok_or_else(|| unknown("processor", &id))?;
                check_signal(factory.signals(), &id, name, *kind)?;
                let processor = factory.create(ctx, &id, config, *kind, next)?;
                next = processor.clone();
                built.push((id, processor));
            }
            built.reverse();
            graph.processors.extend(built);

            for raw in &spec.receivers {
                component_config(conf, "receivers", raw, name)?;
                let id = ComponentId::parse(raw)?;
                let factory = factories
                    .receivers
                    .get(id.type_name())
                    .ok_or_else(|| unknown("receiver", &id))?;
                check_signal(factory.signals(), &id, name, *kind)?;
                receiver_routes
                    .entry(raw.as_str())
                    .or_insert_with(|| (id, SignalRouter::new()))
                    .1
                    .add_route(*kind, next.clone());
            }
        }

        for (raw, (id, router)) in receiver_routes {
            let config = component_config(conf, "receivers", raw, "service")?;
            let factory = factories
                .receivers
                .get(id.type_name())
                .ok_or_else(|| unknown("receiver", &id))?;
            let receiver = factory.create(ctx, &id, config, router)?;
            graph.receivers.push((id, receiver));
        }

        let (state, _) = watch::channel(PipelineState::Starting);
        Ok(Self {
            graph: Arc::new(graph),
            names: service.pipelines.keys().cloned().collect(),
            state: Arc::new(state),
            stop: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Names of the configured pipelines.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn watch(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Starts every component and returns once the pipeline is running.
    ///
    /// # Errors
    ///
    /// Returns the component error that stopped the pipeline from starting,
    /// [`PipelineError::UnexpectedState`] when it is already closing, or
    /// [`PipelineError::Cancelled`] when `cancel` fires first.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let mut states = self.state.subscribe();
        {
            let mut task = self.task.lock().await;
            if task.is_none() {
                *task = Some(self.spawn());
            }
        }

        loop {
            let current = *states.borrow_and_update();
            match current {
                PipelineState::Running => return Ok(()),
                PipelineState::Starting => {}
                other => {
                    return match self.join().await {
                        Some(Err(error)) => Err(error),
                        _ => Err(PipelineError::UnexpectedState(other)),
                    };
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.stop().await;
                    return Err(PipelineError::Cancelled);
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(PipelineError::UnexpectedState(self.state()));
                    }
                }
            }
        }
    }

    fn spawn(&self) -> JoinHandle<Result<(), PipelineError>> {
        let graph = self.graph.clone();
        let state = self.state.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            if let Err(error) = graph.start().await {
                tracing::error!(%error, "Pipeline failed to start");
                state.send_replace(PipelineState::Closing);
                let _ = graph.shutdown().await;
                state.send_replace(PipelineState::Closed);
                return Err(error);
            }

            state.send_replace(PipelineState::Running);
            tracing::info!("Pipeline running");

            stop.cancelled().await;
            state.send_replace(PipelineState::Closing);
            let result = graph.shutdown().await;
            state.send_replace(PipelineState::Closed);
            tracing::info!("Pipeline stopped");
            result
        })
    }

    async fn join(&self) -> Option<Result<(), PipelineError>> {
        let handle = self.task.lock().await.take()?;
        match handle.await {
            Ok(result) => Some(result),
            Err(error) => {
                tracing::error!(%error, "Pipeline task panicked");
                None
            }
        }
    }

    /// Stops the pipeline and waits for every component to shut down.
    /// Calling it again, or before `start`, does nothing.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        self.stop.cancel();
        match self.join().await {
            Some(result) => result,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("pipelines", &self.names)
            .field("state", &self.state())
            .finish()
    }
}
