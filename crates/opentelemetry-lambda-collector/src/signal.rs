//! Telemetry payloads flowing through a pipeline.
//!
//! Every stage of a pipeline hands data onwards through the [`Consumer`]
//! trait. Payloads are the OTLP export requests from `opentelemetry-proto`,
//! so the same value can be produced by the Telemetry API translator, the
//! OTLP receiver, or a processor, and be encoded by an exporter unchanged.

use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, sendable future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The kind of telemetry carried by a [`Signal`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Spans.
    Traces,
    /// Metric data points.
    Metrics,
    /// Log records.
    Logs,
}

impl SignalKind {
    /// All signal kinds, in pipeline declaration order.
    pub const ALL: [SignalKind; 3] = [SignalKind::Traces, SignalKind::Metrics, SignalKind::Logs];

    /// Returns the lowercase name used in pipeline identifiers.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Traces => "traces",
            SignalKind::Metrics => "metrics",
            SignalKind::Logs => "logs",
        }
    }

    /// Parses a pipeline type name (`traces`, `metrics`, `logs`).
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "traces" => Some(SignalKind::Traces),
            "metrics" => Some(SignalKind::Metrics),
            "logs" => Some(SignalKind::Logs),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of telemetry moving between pipeline stages.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Trace spans.
    Traces(ExportTraceServiceRequest),
    /// Metrics.
    Metrics(ExportMetricsServiceRequest),
    /// Log records.
    Logs(ExportLogsServiceRequest),
}

impl Signal {
    /// Returns the kind of this signal.
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Traces(_) => SignalKind::Traces,
            Signal::Metrics(_) => SignalKind::Metrics,
            Signal::Logs(_) => SignalKind::Logs,
        }
    }

    /// Counts spans, metric data points or log records.
    pub fn item_count(&self) -> usize {
        match self {
            Signal::Traces(req) => req
                .resource_spans
                .iter()
                .flat_map(|rs| &rs.scope_spans)
                .map(|ss| ss.spans.len())
                .sum(),
            Signal::Metrics(req) => req
                .resource_metrics
                .iter()
                .flat_map(|rm| &rm.scope_metrics)
                .flat_map(|sm| &sm.metrics)
                .map(|m| match &m.data {
                    Some(Data::Gauge(g)) => g.data_points.len(),
                    Some(Data::Sum(s)) => s.data_points.len(),
                    Some(Data::Histogram(h)) => h.data_points.len(),
                    Some(Data::ExponentialHistogram(h)) => h.data_points.len(),
                    Some(Data::Summary(s)) => s.data_points.len(),
                    None => 0,
                })
                .sum(),
            Signal::Logs(req) => req
                .resource_logs
                .iter()
                .flat_map(|rl| &rl.scope_logs)
                .map(|sl| sl.log_records.len())
                .sum(),
        }
    }

    /// Returns true when the signal carries no resource entries.
    pub fn is_empty(&self) -> bool {
        match self {
            Signal::Traces(req) => req.resource_spans.is_empty(),
            Signal::Metrics(req) => req.resource_metrics.is_empty(),
            Signal::Logs(req) => req.resource_logs.is_empty(),
        }
    }

    /// Appends the resource entries of `other` to this signal.
    ///
    /// Returns `other` unchanged when the kinds differ.
    pub fn append(&mut self, other: Signal) -> Result<(), Signal> {
        match (self, other) {
            (Signal::Traces(a), Signal::Traces(b)) => a.resource_spans.extend(b.resource_spans),
            (Signal::Metrics(a), Signal::Metrics(b)) => {
                a.resource_metrics.extend(b.resource_metrics)
            }
            (Signal::Logs(a), Signal::Logs(b)) => a.resource_logs.extend(b.resource_logs),
            (_, other) => return Err(other),
        }
        Ok(())
    }
}

/// Metadata about the client that produced a signal.
///
/// Travels with the payload through queueing stages so that downstream
/// consumers see the same origin the receiver saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Remote address of the sender, when the receiver knows it.
    pub addr: Option<SocketAddr>,
}

impl ClientInfo {
    /// Client info for a known remote address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self { addr: Some(addr) }
    }
}

/// Errors returned by a [`Consumer`].
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The consumer does not handle this signal kind.
    #[error("{component} does not accept {kind}")]
    Unsupported {
        /// Component that rejected the signal.
        component: String,
        /// Kind of the rejected signal.
        kind: SignalKind,
    },

    /// The consumer has been shut down.
    #[error("{0} has been shut down")]
    Closed(String),

    /// Export to a remote endpoint failed.
    #[error("export failed")]
    Export(#[source] crate::exporter::ExportError),

    /// Several downstream consumers failed.
    #[error("{} downstream consumers failed", .0.len())]
    Multiple(Vec<ConsumerError>),
}

/// A pipeline stage that accepts signals.
///
/// Returning from `consume` means the stage has taken responsibility for the
/// payload; it does not imply the payload reached an exporter.
pub trait Consumer: Send + Sync {
    /// Hands a signal to this stage.
    fn consume(&self, info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>>;
}

/// A shared handle to a [`Consumer`].
pub type SharedConsumer = Arc<dyn Consumer>;

/// Fans a signal out to the first stage of every pipeline of its kind.
///
/// Receivers are shared between pipelines; each pipeline listing a receiver
/// registers its entry consumer here.
#[derive(Clone, Default)]
pub struct SignalRouter {
    routes: BTreeMap<SignalKind, Vec<SharedConsumer>>,
}

impl SignalRouter {
    /// Creates a router with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer for the given kind.
    pub fn add_route(&mut self, kind: SignalKind, consumer: SharedConsumer) {
        self.routes.entry(kind).or_default().push(consumer);
    }

    /// Returns true when at least one consumer accepts `kind`.
    pub fn accepts(&self, kind: SignalKind) -> bool {
        self.routes.get(&kind).is_some_and(|c| !c.is_empty())
    }

    /// Returns the kinds with at least one route.
    pub fn kinds(&self) -> Vec<SignalKind> {
        self.routes
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Delivers `signal` to every consumer of its kind, in registration order.
    ///
    /// Signals of a kind with no route are dropped silently.
    pub async fn route(&self, info: ClientInfo, signal: Signal) -> Result<(), ConsumerError> {
        let Some(consumers) = self.routes.get(&signal.kind()) else {
            return Ok(());
        };

        let mut errors = Vec::new();
        if let Some((last, rest)) = consumers.split_last() {
            for consumer in rest {
                if let Err(e) = consumer.consume(info.clone(), signal.clone()).await {
                    errors.push(e);
                }
            }
            if let Err(e) = last.consume(info, signal).await {
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConsumerError::Multiple(errors)),
        }
    }
}

impl Consumer for SignalRouter {
    fn consume(&self, info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(self.route(info, signal))
    }
}

impl fmt::Debug for SignalRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<_, _> = self.routes.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("SignalRouter").field("routes", &counts).finish()
    }
}
