//! Shared test utilities for collector integration tests.
//!
//! Provides a mock Lambda host serving the Extensions and Telemetry APIs, a
//! recording exporter, and event-driven waiting helpers so tests do not rely
//! on arbitrary sleeps.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
};
use opentelemetry_lambda_collector::component::{
    BuildContext, Component, ComponentError, ComponentId, Exporter, ExporterFactory,
};
use opentelemetry_lambda_collector::signal::{
    BoxFuture, ClientInfo, Consumer, ConsumerError, Signal, SignalKind,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};

pub const EXTENSION_ID: &str = "test-extension-id";

/// Polls an HTTP health endpoint until it responds successfully.
pub async fn wait_for_http_ready(port: u16, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    let url = format!("http://127.0.0.1:{}/health", port);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

    while Instant::now() < deadline {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }

    Err(format!(
        "HTTP server health check timed out after {:?} on port {}",
        timeout, port
    ))
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A call the mock host received.
#[derive(Debug, Clone)]
pub enum HostCall {
    Register { name: String, events: Vec<String> },
    Subscribe(Value),
    InitError(String),
    ExitError(String),
}

struct HostState {
    calls: Mutex<Vec<HostCall>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    account_id: Option<String>,
    changed: Notify,
}

impl HostState {
    fn record(&self, call: HostCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        self.changed.notify_waiters();
    }
}

/// Mock of the Lambda Extensions and Telemetry APIs.
pub struct MockHost {
    addr: SocketAddr,
    state: Arc<HostState>,
    events: mpsc::UnboundedSender<Value>,
    server: tokio::task::JoinHandle<()>,
}

impl MockHost {
    pub async fn start() -> Self {
        Self::start_with_account(Some("123456789012")).await
    }

    pub async fn start_with_account(account_id: Option<&str>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(HostState {
            calls: Mutex::new(Vec::new()),
            events: tokio::sync::Mutex::new(receiver),
            account_id: account_id.map(str::to_string),
            changed: Notify::new(),
        });

        let app = Router::new()
            .route("/2020-01-01/extension/register", post(register))
            .route("/2020-01-01/extension/event/next", get(next_event))
            .route("/2020-01-01/extension/init/error", post(init_error))
            .route("/2020-01-01/extension/exit/error", post(exit_error))
            .route("/2022-07-01/telemetry", put(subscribe))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock host");
        let addr = listener.local_addr().expect("mock host address");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            events,
            server,
        }
    }

    /// Value for `AWS_LAMBDA_RUNTIME_API`.
    pub fn runtime_api(&self) -> String {
        self.addr.to_string()
    }

    pub fn invoke(&self, request_id: &str) {
        let _ = self.events.send(json!({
            "eventType": "INVOKE",
            "deadlineMs": 1_700_000_000_000_i64,
            "requestId": request_id,
            "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:test",
            "tracing": {"type": "X-Amzn-Trace-Id", "value": "Root=1-5759e988-bd862e3fe1be46a994272793"}
        }));
    }

    pub fn shutdown(&self, reason: &str) {
        let _ = self.events.send(json!({
            "eventType": "SHUTDOWN",
            "deadlineMs": 1_700_000_002_000_i64,
            "shutdownReason": reason
        }));
    }

    /// Makes the next `event/next` poll fail with a server error.
    pub fn fail_next(&self) {
        let _ = self.events.send(Value::Null);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscriptions(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Subscribe(body) => Some(body),
                _ => None,
            })
            .collect()
    }

    /// Waits until at least `count` subscriptions have been made.
    pub async fn wait_for_subscriptions(&self, count: usize, timeout: Duration) -> Vec<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.state.changed.notified();
            let subscriptions = self.subscriptions();
            if subscriptions.len() >= count || Instant::now() >= deadline {
                return subscriptions;
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), changed).await;
        }
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn register(
    State(state): State<Arc<HostState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let name = headers
        .get("Lambda-Extension-Name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let events = body["events"]
        .as_array()
        .map(|events| {
            events
                .iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    state.record(HostCall::Register { name, events });

    let mut response = json!({
        "functionName": "test-function",
        "functionVersion": "$LATEST",
        "handler": "index.handler"
    });
    if let Some(account_id) = &state.account_id {
        response["accountId"] = json!(account_id);
    }
    (
        [("Lambda-Extension-Identifier", EXTENSION_ID)],
        Json(response),
    )
}

async fn next_event(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    let mut events = state.events.lock().await;
    match events.recv().await {
        Some(Value::Null) | None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Some(event) => (StatusCode::OK, Json(event)).into_response(),
    }
}

fn error_type(headers: &HeaderMap) -> String {
    headers
        .get("Lambda-Extension-Function-Error-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn init_error(State(state): State<Arc<HostState>>, headers: HeaderMap) -> impl IntoResponse {
    state.record(HostCall::InitError(error_type(&headers)));
    (StatusCode::ACCEPTED, Json(json!({"status": "OK"})))
}

async fn exit_error(State(state): State<Arc<HostState>>, headers: HeaderMap) -> impl IntoResponse {
    state.record(HostCall::ExitError(error_type(&headers)));
    (StatusCode::ACCEPTED, Json(json!({"status": "OK"})))
}

async fn subscribe(
    State(state): State<Arc<HostState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if headers.get("Lambda-Extension-Identifier").is_none() {
        return StatusCode::FORBIDDEN;
    }
    state.record(HostCall::Subscribe(body));
    StatusCode::OK
}

/// Pushes a Telemetry API batch to a listener URI.
pub async fn push_events(uri: &str, events: &Value) -> reqwest::StatusCode {
    reqwest::Client::new()
        .post(uri)
        .json(events)
        .send()
        .await
        .expect("push telemetry events")
        .status()
}

/// Exporter that keeps every signal it receives.
#[derive(Default)]
pub struct Recorder {
    signals: Mutex<Vec<Signal>>,
    stopped: Mutex<bool>,
}

impl Recorder {
    pub fn signals(&self) -> Vec<Signal> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn span_names(&self) -> Vec<String> {
        self.signals()
            .iter()
            .filter_map(|signal| match signal {
                Signal::Traces(req) => Some(req),
                _ => None,
            })
            .flat_map(|req| &req.resource_spans)
            .flat_map(|rs| &rs.scope_spans)
            .flat_map(|ss| &ss.spans)
            .map(|span| span.name.clone())
            .collect()
    }

    pub fn stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Consumer for Recorder {
    fn consume(&self, _info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal);
        Box::pin(async { Ok(()) })
    }
}

impl Component for Recorder {
    fn shutdown(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        Box::pin(async { Ok(()) })
    }
}

impl Exporter for Recorder {}

/// Factory handing out one shared [`Recorder`] as the `recorder` exporter.
#[derive(Clone, Default)]
pub struct RecorderFactory {
    pub recorder: Arc<Recorder>,
}

impl ExporterFactory for RecorderFactory {
    fn type_name(&self) -> &'static str {
        "recorder"
    }

    fn signals(&self) -> &'static [SignalKind] {
        &SignalKind::ALL
    }

    fn create(
        &self,
        _ctx: &BuildContext,
        _id: &ComponentId,
        _config: &serde_yaml::Value,
    ) -> Result<Arc<dyn Exporter>, ComponentError> {
        Ok(self.recorder.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_http_ready_timeout() {
        let result = wait_for_http_ready(19999, Duration::from_millis(100)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("timed out"));
    }
}
