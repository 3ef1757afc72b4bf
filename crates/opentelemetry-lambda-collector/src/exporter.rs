//! Pipeline exporters.
//!
//! `otlphttp` (also registered as `otlp`) posts protobuf-encoded OTLP
//! requests to `<endpoint>/v1/{traces,metrics,logs}`, retrying with
//! exponential backoff on 408, 429 and 5xx. `debug` writes every payload
//! to stdout as one JSON line.

use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, Exporter, ExporterFactory,
    decode_config,
};
use crate::config::duration_ms;
use crate::signal::{BoxFuture, ClientInfo, Consumer, ConsumerError, Signal, SignalKind};
use prost::Message;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error during export.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// HTTP request failed.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code returned by server.
        status: u16,
        /// Response body from server.
        body: String,
    },

    /// Encoding failed.
    #[error("failed to encode request")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// No endpoint configured for the signal.
    #[error("no endpoint configured")]
    NoEndpoint,
}

impl ExportError {
    pub(crate) fn encode<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Encode(Box::new(error))
    }

    pub(crate) fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }
}

/// Payload compression.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Uncompressed.
    None,
    /// Gzip.
    #[default]
    Gzip,
}

/// `retry_on_failure` settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry failed requests.
    pub enabled: bool,
    /// Delay before the first retry; doubled after each attempt.
    #[serde(with = "duration_ms")]
    pub initial_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: INITIAL_BACKOFF,
        }
    }
}

/// `sending_queue` settings. Accepted for compatibility; requests are
/// always sent inline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SendingQueueConfig {
    /// Whether a queue was requested.
    pub enabled: bool,
}

/// `otlphttp` exporter config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OtlpHttpConfig {
    /// Base URL; signal paths are appended.
    pub endpoint: Option<String>,
    /// Full URL for traces, overriding `endpoint`.
    pub traces_endpoint: Option<String>,
    /// Full URL for metrics, overriding `endpoint`.
    pub metrics_endpoint: Option<String>,
    /// Full URL for logs, overriding `endpoint`.
    pub logs_endpoint: Option<String>,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Body compression.
    pub compression: Compression,
    /// Per-request timeout.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Retry policy.
    pub retry_on_failure: RetryConfig,
    /// Queue settings.
    pub sending_queue: SendingQueueConfig,
}

impl Default for OtlpHttpConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            traces_endpoint: None,
            metrics_endpoint: None,
            logs_endpoint: None,
            headers: BTreeMap::new(),
            compression: Compression::Gzip,
            timeout: DEFAULT_TIMEOUT,
            retry_on_failure: RetryConfig::default(),
            sending_queue: SendingQueueConfig::default(),
        }
    }
}

impl OtlpHttpConfig {
    /// Returns the URL requests of `kind` are posted to.
    pub fn url(&self, kind: SignalKind) -> Option<String> {
        let specific = match kind {
            SignalKind::Traces => &self.traces_endpoint,
            SignalKind::Metrics => &self.metrics_endpoint,
            SignalKind::Logs => &self.logs_endpoint,
        };
        if let Some(url) = specific {
            return Some(url.clone());
        }
        let base = self.endpoint.as_deref()?.trim_end_matches('/');
        Some(format!("{base}/v1/{kind}"))
    }
}

/// OTLP/HTTP protobuf exporter.
pub struct OtlpHttpExporter {
    id: ComponentId,
    config: OtlpHttpConfig,
    client: Client,
}

impl OtlpHttpExporter {
    /// Creates an exporter with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(id: ComponentId, config: OtlpHttpConfig) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ExportError::Http)?;

        if config.sending_queue.enabled {
            tracing::debug!(exporter = %id, "Sending queue requested; exporting inline");
        }

        Ok(Self { id, config, client })
    }

    /// Sends `signal`, retrying transient failures.
    pub async fn export(&self, signal: &Signal) -> Result<(), ExportError> {
        let url = self.config.url(signal.kind()).ok_or(ExportError::NoEndpoint)?;
        let body = match signal {
            Signal::Traces(req) => self.encode_request(req)?,
            Signal::Metrics(req) => self.encode_request(req)?,
            Signal::Logs(req) => self.encode_request(req)?,
        };

        let attempts = if self.config.retry_on_failure.enabled {
            MAX_RETRIES
        } else {
            1
        };
        let mut backoff = self.config.retry_on_failure.initial_interval;
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.try_export(&url, body.clone()).await {
                Ok(()) => return Ok(()),
                Err(ExportError::Status { status, body }) if !Self::is_retryable(status) => {
                    tracing::error!(exporter = %self.id, status, "Received non-retryable status code, not retrying");
                    return Err(ExportError::status(status, body));
                }
                Err(e) => {
                    tracing::warn!(
                        exporter = %self.id,
                        attempt = attempt + 1,
                        max_retries = attempts,
                        error = %e,
                        "Export attempt failed"
                    );
                    last_error = Some(e);

                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(ExportError::NoEndpoint))
    }

    /// Retryable: 408, 429 and 5xx. Every other 4xx is final.
    fn is_retryable(status: u16) -> bool {
        matches!(status, 408 | 429) || (500..600).contains(&status)
    }

    async fn try_export(&self, url: &str, body: Vec<u8>) -> Result<(), ExportError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/x-protobuf")
            .body(body);

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        if self.config.compression == Compression::Gzip {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = request.send().await.map_err(ExportError::Http)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ExportError::status(status.as_u16(), body))
        }
    }

    fn encode_request<T: Message>(&self, request: &T) -> Result<Vec<u8>, ExportError> {
        let mut buf = Vec::with_capacity(request.encoded_len());
        request.encode(&mut buf).map_err(ExportError::encode)?;

        if self.config.compression == Compression::Gzip {
            use flate2::Compression as GzCompression;
            use flate2::write::GzEncoder;

            let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
            encoder.write_all(&buf).map_err(ExportError::encode)?;
            encoder.finish().map_err(ExportError::encode)
        } else {
            Ok(buf)
        }
    }
}

impl Consumer for OtlpHttpExporter {
    fn consume(&self, _info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(async move {
            if signal.is_empty() {
                return Ok(());
            }
            self.export(&signal).await.map_err(ConsumerError::Export)
        })
    }
}

impl Component for OtlpHttpExporter {}

impl Exporter for OtlpHttpExporter {}

/// Factory for `otlphttp` and its `otlp` alias.
#[derive(Debug, Clone, Copy)]
pub struct OtlpHttpExporterFactory {
    type_name: &'static str,
}

impl OtlpHttpExporterFactory {
    /// Registers the exporter under `type_name`.
    pub fn new(type_name: &'static str) -> Self {
        Self { type_name }
    }
}

impl ExporterFactory for OtlpHttpExporterFactory {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn signals(&self) -> &'static [SignalKind] {
        &SignalKind::ALL
    }

    fn create(
        &self,
        _ctx: &BuildContext,
        id: &ComponentId,
        config: &serde_yaml::Value,
    ) -> Result<Arc<dyn Exporter>, ComponentError> {
        let config: OtlpHttpConfig = decode_config(id, config)?;
        if SignalKind::ALL.iter().all(|kind| config.url(*kind).is_none()) {
            return Err(ComponentError::Exporter {
                id: id.clone(),
                source: ExportError::NoEndpoint,
            });
        }
        let exporter = OtlpHttpExporter::new(id.clone(), config).map_err(|source| {
            ComponentError::Exporter {
                id: id.clone(),
                source,
            }
        })?;
        Ok(Arc::new(exporter))
    }
}

/// How much of each payload the debug exporter prints.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Signal type and item count.
    Basic,
    /// Same as basic.
    Normal,
    /// The whole request.
    #[default]
    Detailed,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DebugConfig {
    verbosity: Verbosity,
}

#[derive(Serialize)]
struct DebugLine<'a> {
    #[serde(rename = "type")]
    signal_type: &'a str,
    items: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<serde_json::Value>,
}

/// Writes payloads as JSON lines.
pub struct DebugExporter {
    verbosity: Verbosity,
    out: Mutex<Box<dyn Write + Send>>,
}

impl DebugExporter {
    /// An exporter writing to stdout.
    pub fn stdout(verbosity: Verbosity) -> Self {
        Self::with_writer(verbosity, Box::new(std::io::stdout()))
    }

    /// An exporter writing to `out`.
    pub fn with_writer(verbosity: Verbosity, out: Box<dyn Write + Send>) -> Self {
        Self {
            verbosity,
            out: Mutex::new(out),
        }
    }

    fn line(&self, signal: &Signal) -> Result<String, serde_json::Error> {
        let request = match self.verbosity {
            Verbosity::Detailed => Some(match signal {
                Signal::Traces(req) => serde_json::to_value(req)?,
                Signal::Metrics(req) => serde_json::to_value(req)?,
                Signal::Logs(req) => serde_json::to_value(req)?,
            }),
            Verbosity::Basic | Verbosity::Normal => None,
        };
        serde_json::to_string(&DebugLine {
            signal_type: signal.kind().as_str(),
            items: signal.item_count(),
            request,
        })
    }
}

impl Consumer for DebugExporter {
    fn consume(&self, _info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(async move {
            let line = self
                .line(&signal)
                .map_err(|e| ConsumerError::Export(ExportError::encode(e)))?;
            let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
            // Broken pipes are not worth failing the pipeline over.
            let _ = writeln!(out, "{line}");
            Ok(())
        })
    }
}

impl Component for DebugExporter {}

impl Exporter for DebugExporter {}

/// Factory for `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugExporterFactory;

impl ExporterFactory for DebugExporterFactory {
    fn type_name(&self) -> &'static str {
        "debug"
    }

    fn signals(&self) -> &'static [SignalKind] {
        &SignalKind::ALL
    }

    fn create(
        &self,
        _ctx: &BuildContext,
        id: &ComponentId,
        config: &serde_yaml::Value,
    ) -> Result<Arc<dyn Exporter>, ComponentError> {
        let config: DebugConfig = decode_config(id, config)?;
        Ok(Arc::new(DebugExporter::stdout(config.verbosity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Bytes, extract::State, http::HeaderMap, http::StatusCode, routing::post};
    use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
    use std::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_traces() -> Signal {
        Signal::Traces(ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    spans: vec![Span {
                        name: "test-span".to_string(),
                        trace_id: vec![1; 16],
                        span_id: vec![1; 8],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
    }

    #[derive(Clone, Default)]
    struct Collector {
        hits: Arc<AtomicUsize>,
        fail_first: usize,
        fail_status: u16,
        bodies: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
    }

    async fn handle(State(c): State<Collector>, headers: HeaderMap, body: Bytes) -> StatusCode {
        let hit = c.hits.fetch_add(1, Ordering::SeqCst);
        c.bodies.lock().unwrap().push((headers, body));
        if hit < c.fail_first {
            StatusCode::from_u16(c.fail_status).unwrap()
        } else {
            StatusCode::OK
        }
    }

    async fn spawn_collector(collector: Collector) -> String {
        let app = Router::new()
            .route("/v1/traces", post(handle))
            .with_state(collector);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn exporter(endpoint: String, compression: Compression) -> OtlpHttpExporter {
        let config = OtlpHttpConfig {
            endpoint: Some(endpoint),
            compression,
            retry_on_failure: RetryConfig {
                enabled: true,
                initial_interval: Duration::from_millis(1),
            },
            ..Default::default()
        };
        OtlpHttpExporter::new(ComponentId::new("otlphttp"), config).unwrap()
    }

    #[test]
    fn test_signal_urls() {
        let config = OtlpHttpConfig {
            endpoint: Some("http://collector:4318/".to_string()),
            logs_endpoint: Some("http://logs:9000/ingest".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.url(SignalKind::Traces).as_deref(),
            Some("http://collector:4318/v1/traces")
        );
        assert_eq!(
            config.url(SignalKind::Logs).as_deref(),
            Some("http://logs:9000/ingest")
        );
        assert_eq!(OtlpHttpConfig::default().url(SignalKind::Metrics), None);
    }

    #[tokio::test]
    async fn test_export_protobuf() {
        let collector = Collector::default();
        let endpoint = spawn_collector(collector.clone()).await;

        exporter(endpoint, Compression::None)
            .consume(ClientInfo::default(), make_traces())
            .await
            .unwrap();

        let bodies = collector.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        let (headers, body) = &bodies[0];
        assert_eq!(headers["content-type"], "application/x-protobuf");
        let decoded = ExportTraceServiceRequest::decode(body.as_ref()).unwrap();
        assert_eq!(decoded.resource_spans[0].scope_spans[0].spans[0].name, "test-span");
    }

    #[tokio::test]
    async fn test_export_gzip() {
        use std::io::Read;

        let collector = Collector::default();
        let endpoint = spawn_collector(collector.clone()).await;

        exporter(endpoint, Compression::Gzip)
            .consume(ClientInfo::default(), make_traces())
            .await
            .unwrap();

        let bodies = collector.bodies.lock().unwrap();
        let (headers, body) = &bodies[0];
        assert_eq!(headers["content-encoding"], "gzip");
        let mut raw = Vec::new();
        flate2::read::GzDecoder::new(body.as_ref())
            .read_to_end(&mut raw)
            .unwrap();
        assert!(ExportTraceServiceRequest::decode(raw.as_slice()).is_ok());
    }

    #[tokio::test]
    async fn test_retries_transient_status() {
        let collector = Collector {
            fail_first: 2,
            fail_status: 503,
            ..Default::default()
        };
        let endpoint = spawn_collector(collector.clone()).await;

        exporter(endpoint, Compression::None)
            .consume(ClientInfo::default(), make_traces())
            .await
            .unwrap();
        assert_eq!(collector.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_client_error() {
        let collector = Collector {
            fail_first: 10,
            fail_status: 400,
            ..Default::default()
        };
        let endpoint = spawn_collector(collector.clone()).await;

        let err = exporter(endpoint, Compression::None)
            .consume(ClientInfo::default(), make_traces())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::Export(ExportError::Status { status: 400, .. })
        ));
        assert_eq!(collector.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_signal_endpoint() {
        let config = OtlpHttpConfig {
            traces_endpoint: Some("http://127.0.0.1:1/v1/traces".to_string()),
            ..Default::default()
        };
        let exporter = OtlpHttpExporter::new(ComponentId::new("otlphttp"), config).unwrap();
        let logs = Signal::Logs(opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest {
            resource_logs: vec![Default::default()],
        });
        let err = exporter.export(&logs).await.unwrap_err();
        assert!(matches!(err, ExportError::NoEndpoint));
    }

    #[test]
    fn test_factory_requires_endpoint() {
        let factory = OtlpHttpExporterFactory::new("otlphttp");
        let ctx = BuildContext::default();
        let id = ComponentId::new("otlphttp");

        let result = factory.create(&ctx, &id, &serde_yaml::Value::Null);
        assert!(matches!(result, Err(ComponentError::Exporter { .. })));

        let config: serde_yaml::Value = serde_yaml::from_str(
            "endpoint: http://localhost:4318\ntimeout: 5s\nsending_queue:\n  enabled: false\nretry_on_failure:\n  enabled: false",
        )
        .unwrap();
        assert!(factory.create(&ctx, &id, &config).is_ok());
    }

    #[test]
    fn test_export_error_display() {
        let err = ExportError::NoEndpoint;
        assert_eq!(format!("{}", err), "no endpoint configured");

        let err = ExportError::status(500, "Internal Server Error");
        assert!(format!("{}", err).contains("500"));
    }

    #[test]
    fn test_export_error_chain() {
        let err = ExportError::encode(std::io::Error::other("test error"));
        assert!(err.source().is_some());
        assert!(format!("{}", err).contains("encode"));
    }

    #[test]
    fn test_is_retryable() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(OtlpHttpExporter::is_retryable(status), "{status}");
        }
        for status in [400, 401, 403, 404, 405] {
            assert!(!OtlpHttpExporter::is_retryable(status), "{status}");
        }
    }

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_debug_exporter_writes_json_lines() {
        let buffer = Buffer::default();
        let exporter = DebugExporter::with_writer(Verbosity::Detailed, Box::new(buffer.clone()));

        exporter
            .consume(ClientInfo::default(), make_traces())
            .await
            .unwrap();
        exporter
            .consume(ClientInfo::default(), make_traces())
            .await
            .unwrap();

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let line: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(line["type"], "traces");
        assert_eq!(line["items"], 1);
        assert!(line["request"]["resourceSpans"].is_array());
    }

    #[tokio::test]
    async fn test_debug_exporter_basic_omits_request() {
        let buffer = Buffer::default();
        let exporter = DebugExporter::with_writer(Verbosity::Basic, Box::new(buffer.clone()));
        exporter
            .consume(ClientInfo::default(), make_traces())
            .await
            .unwrap();

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert!(line.get("request").is_none());
    }
}
