//! OTLP/HTTP receiver for the function's own telemetry.
//!
//! Serves `/v1/traces`, `/v1/metrics` and `/v1/logs`, accepting protobuf or
//! JSON bodies with optional gzip.

use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, ReceiverFactory, decode_config,
};
use crate::listener::ListenerError;
use crate::signal::{BoxFuture, ClientInfo, Signal, SignalKind, SignalRouter};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_ENCODING, CONTENT_TYPE},
    },
    routing::{get, post},
};
use flate2::read::GzDecoder;
use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_ENDPOINT: &str = "localhost:4318";

/// `otlp` receiver config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtlpReceiverConfig {
    /// Protocol settings. Only `http` is served.
    pub protocols: Protocols,
}

/// `protocols` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Protocols {
    /// OTLP/HTTP settings.
    pub http: Option<HttpProtocol>,
}

/// `protocols.http` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpProtocol {
    /// `host:port` to bind.
    pub endpoint: Option<String>,
}

impl OtlpReceiverConfig {
    fn endpoint(&self) -> &str {
        self.protocols
            .http
            .as_ref()
            .and_then(|http| http.endpoint.as_deref())
            .unwrap_or(DEFAULT_ENDPOINT)
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `ready`.
    pub status: &'static str,
    /// Number of requests accepted.
    pub signals_received: u64,
}

struct ReceiverState {
    id: ComponentId,
    next: SignalRouter,
    signals_received: AtomicU64,
}

struct Running {
    local_addr: SocketAddr,
    token: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
}

/// OTLP/HTTP receiver component.
pub struct OtlpReceiver {
    endpoint: String,
    state: Arc<ReceiverState>,
    running: Mutex<Option<Running>>,
}

impl OtlpReceiver {
    /// Creates a receiver delivering into `next`.
    pub fn new(id: ComponentId, config: &OtlpReceiverConfig, next: SignalRouter) -> Self {
        Self {
            endpoint: config.endpoint().to_string(),
            state: Arc::new(ReceiverState {
                id,
                next,
                signals_received: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Returns the bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|r| r.local_addr)
    }

    /// Returns the number of requests accepted.
    pub fn signals_received(&self) -> u64 {
        self.state.signals_received.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener_error(&self, source: std::io::Error) -> ComponentError {
        ComponentError::Listener {
            id: self.state.id.clone(),
            source: ListenerError::Bind {
                address: self.endpoint.clone(),
                source,
            },
        }
    }
}

impl Component for OtlpReceiver {
    fn start(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            if self.lock().is_some() {
                return Ok(());
            }

            let listener = TcpListener::bind(&self.endpoint)
                .await
                .map_err(|e| self.listener_error(e))?;
            let local_addr = listener.local_addr().map_err(|e| self.listener_error(e))?;

            let app = Router::new()
                .route("/health", get(handle_health))
                .route("/v1/traces", post(handle_traces))
                .route("/v1/metrics", post(handle_metrics))
                .route("/v1/logs", post(handle_logs))
                .with_state(self.state.clone());

            let token = CancellationToken::new();
            let shutdown = token.clone().cancelled_owned();
            let server = tokio::spawn(async move {
                axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(shutdown)
                .await
            });

            tracing::info!(receiver = %self.state.id, %local_addr, "OTLP HTTP receiver started");
            *self.lock() = Some(Running {
                local_addr,
                token,
                server,
            });
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            let Some(running) = self.lock().take() else {
                return Ok(());
            };
            running.token.cancel();
            if let Err(error) = running.server.await {
                tracing::warn!(receiver = %self.state.id, %error, "OTLP HTTP receiver task failed");
            }
            Ok(())
        })
    }
}

/// Factory for `otlp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtlpReceiverFactory;

impl ReceiverFactory for OtlpReceiverFactory {
    fn type_name(&self) -> &'static str {
        "otlp"
    }

    fn signals(&self) -> &'static [SignalKind] {
        &SignalKind::ALL
    }

    fn create(
        &self,
        _ctx: &BuildContext,
        id: &ComponentId,
        config: &serde_yaml::Value,
        next: SignalRouter,
    ) -> Result<Arc<dyn Component>, ComponentError> {
        let config: OtlpReceiverConfig = decode_config(id, config)?;
        Ok(Arc::new(OtlpReceiver::new(id.clone(), &config, next)))
    }
}

async fn handle_health(State(state): State<Arc<ReceiverState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ready",
        signals_received: state.signals_received.load(Ordering::Relaxed),
    })
}

async fn deliver(state: &ReceiverState, addr: SocketAddr, signal: Signal) -> StatusCode {
    let kind = signal.kind();
    match state.next.route(ClientInfo::from_addr(addr), signal).await {
        Ok(()) => {
            state.signals_received.fetch_add(1, Ordering::Relaxed);
            StatusCode::OK
        }
        Err(error) => {
            tracing::error!(receiver = %state.id, %kind, %error, "Failed to deliver OTLP request");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn handle_traces(
    State(state): State<Arc<ReceiverState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    match parse_request::<ExportTraceServiceRequest>(&headers, &body) {
        Ok(request) => deliver(&state, addr, Signal::Traces(request)).await,
        Err(status) => status,
    }
}

async fn handle_metrics(
    State(state): State<Arc<ReceiverState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    match parse_request::<ExportMetricsServiceRequest>(&headers, &body) {
        Ok(request) => deliver(&state, addr, Signal::Metrics(request)).await,
        Err(status) => status,
    }
}

async fn handle_logs(
    State(state): State<Arc<ReceiverState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    match parse_request::<ExportLogsServiceRequest>(&headers, &body) {
        Ok(request) => deliver(&state, addr, Signal::Logs(request)).await,
        Err(status) => status,
    }
}

fn header_contains(value: Option<&HeaderValue>, needle: &str) -> bool {
    value
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(needle))
}

fn parse_request<T>(headers: &HeaderMap, body: &Bytes) -> Result<T, StatusCode>
where
    T: Message + Default + serde::de::DeserializeOwned,
{
    let decompressed: Vec<u8>;
    let body_bytes: &[u8] = if header_contains(headers.get(CONTENT_ENCODING), "gzip") {
        decompressed = decompress_gzip(body)?;
        &decompressed
    } else {
        body.as_ref()
    };

    if header_contains(headers.get(CONTENT_TYPE), "application/json") {
        serde_json::from_slice(body_bytes).map_err(|e| {
            tracing::error!(error = %e, "Failed to parse JSON request");
            StatusCode::BAD_REQUEST
        })
    } else {
        T::decode(body_bytes).map_err(|e| {
            tracing::error!(error = %e, "Failed to parse protobuf request");
            StatusCode::BAD_REQUEST
        })
    }
}

fn decompress_gzip(body: &Bytes) -> Result<Vec<u8>, StatusCode> {
    let mut decoder = GzDecoder::new(body.as_ref());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).map_err(|e| {
        tracing::error!(error = %e, "Failed to decompress gzip body");
        StatusCode::BAD_REQUEST
    })?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Consumer, ConsumerError};
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};

    fn headers(content_type: &'static str, encoding: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        if let Some(encoding) = encoding {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        }
        headers
    }

    fn request(name: &str) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    spans: vec![Span {
                        name: name.to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_parse_traces_protobuf() {
        let body = Bytes::from(request("test-span").encode_to_vec());
        let parsed: ExportTraceServiceRequest =
            parse_request(&headers("application/x-protobuf", None), &body).unwrap();
        assert_eq!(parsed.resource_spans[0].scope_spans[0].spans[0].name, "test-span");
    }

    #[test]
    fn test_parse_traces_json() {
        let body = Bytes::from(r#"{"resourceSpans":[]}"#);
        let parsed: ExportTraceServiceRequest =
            parse_request(&headers("application/json", None), &body).unwrap();
        assert!(parsed.resource_spans.is_empty());
    }

    #[test]
    fn test_parse_invalid_bodies() {
        let result: Result<ExportTraceServiceRequest, _> =
            parse_request(&headers("application/x-protobuf", None), &Bytes::from("invalid"));
        assert_eq!(result.unwrap_err(), StatusCode::BAD_REQUEST);

        let result: Result<ExportTraceServiceRequest, _> =
            parse_request(&headers("application/json", None), &Bytes::from("{invalid}"));
        assert_eq!(result.unwrap_err(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_gzip_compressed_protobuf() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&request("compressed-span").encode_to_vec())
            .unwrap();
        let body = Bytes::from(encoder.finish().unwrap());

        let parsed: ExportTraceServiceRequest =
            parse_request(&headers("application/x-protobuf", Some("gzip")), &body).unwrap();
        assert_eq!(
            parsed.resource_spans[0].scope_spans[0].spans[0].name,
            "compressed-span"
        );
    }

    #[test]
    fn test_default_endpoint() {
        assert_eq!(OtlpReceiverConfig::default().endpoint(), "localhost:4318");
        let config: OtlpReceiverConfig =
            serde_yaml::from_str("protocols:\n  http:\n    endpoint: 0.0.0.0:4400").unwrap();
        assert_eq!(config.endpoint(), "0.0.0.0:4400");
    }

    #[derive(Default)]
    struct Recorder(std::sync::Mutex<Vec<(ClientInfo, Signal)>>);

    impl Consumer for Recorder {
        fn consume(&self, info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
            self.0.lock().unwrap().push((info, signal));
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_serves_and_routes() {
        let recorder = Arc::new(Recorder::default());
        let mut router = SignalRouter::new();
        router.add_route(SignalKind::Traces, recorder.clone());

        let config: OtlpReceiverConfig =
            serde_yaml::from_str("protocols:\n  http:\n    endpoint: 127.0.0.1:0").unwrap();
        let receiver = OtlpReceiver::new(ComponentId::new("otlp"), &config, router);
        receiver.start().await.unwrap();
        let addr = receiver.local_addr().unwrap();

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/v1/traces"))
            .header("content-type", "application/x-protobuf")
            .body(request("from-function").encode_to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(receiver.signals_received(), 1);

        receiver.shutdown().await.unwrap();
        receiver.shutdown().await.unwrap();

        let received = recorder.0.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].0.addr.is_some());
        assert_eq!(received[0].1.item_count(), 1);
    }
}
