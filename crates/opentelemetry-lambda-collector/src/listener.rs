//! HTTP listener for Telemetry API pushes.
//!
//! The host POSTs JSON arrays of events to the listener. A listener either
//! queues them, so the lifecycle manager can block until an invocation's
//! `platform.runtimeDone` has been delivered, or hands each batch to an
//! [`EventSink`] straight away.
//!
//! The handler answers 200 to everything, malformed bodies included: the
//! host retries failed pushes, and retrying a body that will never parse
//! only grows its buffer.

use crate::event::{Event, EventType};
use crate::signal::BoxFuture;
use axum::{Router, body::Bytes, extract::State, http::StatusCode, routing::post};
use rand::Rng;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Grace period for in-flight requests on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Ports tried when the listener picks its own.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

const BIND_ATTEMPTS: usize = 5;
const INITIAL_QUEUE_CAPACITY: usize = 5;
const SANDBOX_HOST: &str = "sandbox.localdomain";

/// Errors from the listener.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The server socket could not be bound.
    #[error("failed to bind telemetry listener on {address}")]
    Bind {
        /// Address that was tried last.
        address: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// `start` was called on a running listener.
    #[error("telemetry listener is already running")]
    AlreadyStarted,

    /// The listener was shut down while waiting.
    #[error("telemetry listener is closed")]
    Closed,

    /// The caller cancelled the wait.
    #[error("wait for request {request_id} was cancelled")]
    Cancelled {
        /// Invocation that was being waited for.
        request_id: String,
    },
}

/// Receives each batch in translating mode.
pub trait EventSink: Send + Sync {
    /// Handles one pushed batch. The host's request completes once this
    /// returns.
    fn handle(&self, events: Vec<Event>) -> BoxFuture<'_, ()>;
}

/// Returns the address the listener binds, as `host:port`.
///
/// Under `sam local` the host part is empty so every interface is bound;
/// on Lambda the listener must be reachable as `sandbox.localdomain`.
pub fn listen_address(port: u16, sam_local: bool) -> String {
    if sam_local {
        format!(":{port}")
    } else {
        format!("{SANDBOX_HOST}:{port}")
    }
}

/// Returns the URI to subscribe for a listener bound to `address`.
pub fn listener_uri(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("http://localhost:{port}/"),
        None => format!("http://{address}/"),
    }
}

fn bind_target(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    }
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

/// FIFO of received events, drained by [`Listener::wait`].
#[derive(Debug)]
struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(INITIAL_QUEUE_CAPACITY),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, events: Vec<Event>) {
        self.lock().events.extend(events);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.lock().events.len()
    }
}

#[derive(Clone)]
enum Mode {
    Queueing(Arc<EventQueue>),
    Translating(Arc<dyn EventSink>),
}

struct Running {
    local_addr: SocketAddr,
    token: CancellationToken,
    server: JoinHandle<io::Result<()>>,
}

/// Telemetry API listener.
pub struct Listener {
    mode: Mode,
    queue: Arc<EventQueue>,
    sam_local: bool,
    running: Option<Running>,
}

impl Listener {
    /// Creates a listener that queues events for [`Listener::wait`].
    pub fn queueing(sam_local: bool) -> Self {
        let queue = Arc::new(EventQueue::new());
        Self {
            mode: Mode::Queueing(queue.clone()),
            queue,
            sam_local,
            running: None,
        }
    }

    /// Creates a listener that hands every batch to `sink`.
    pub fn translating(sink: Arc<dyn EventSink>, sam_local: bool) -> Self {
        Self {
            mode: Mode::Translating(sink),
            queue: Arc::new(EventQueue::new()),
            sam_local,
            running: None,
        }
    }

    /// Starts serving and returns the URI to subscribe.
    ///
    /// With `port` unset a random port in [`EPHEMERAL_PORTS`] is used,
    /// retrying a few times when the port is taken.
    pub async fn start(&mut self, port: Option<u16>) -> Result<String, ListenerError> {
        if self.running.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }

        let (listener, address) = match port {
            Some(port) => {
                let address = listen_address(port, self.sam_local);
                (bind(&address).await?, address)
            }
            None => self.bind_random().await?,
        };

        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            address: address.clone(),
            source,
        })?;

        let app = Router::new()
            .route("/", post(handle_events))
            .with_state(self.mode.clone());

        let token = CancellationToken::new();
        let shutdown = token.clone().cancelled_owned();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
        });

        let uri = listener_uri(&address);
        tracing::info!(%address, %local_addr, %uri, "Telemetry listener started");

        self.running = Some(Running {
            local_addr,
            token,
            server,
        });
        Ok(uri)
    }

    async fn bind_random(&self) -> Result<(TcpListener, String), ListenerError> {
        let mut last_error = None;

        for _ in 0..BIND_ATTEMPTS {
            let port = rand::rng().random_range(EPHEMERAL_PORTS);
            let address = listen_address(port, self.sam_local);
            match bind(&address).await {
                Ok(listener) => return Ok((listener, address)),
                Err(ListenerError::Bind { source, .. })
                    if source.kind() == io::ErrorKind::AddrInUse =>
                {
                    tracing::debug!(port, "Listener port in use, retrying");
                    last_error = Some(ListenerError::Bind { address, source });
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(ListenerError::Closed))
    }

    /// Returns the bound socket address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Returns the number of queued, not yet consumed events.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Consumes queued events until `platform.runtimeDone` for `request_id`.
    ///
    /// Events before the match are discarded. Returns
    /// [`ListenerError::Closed`] once the listener is shut down and the
    /// queue is drained, and [`ListenerError::Cancelled`] when `cancel`
    /// fires first.
    pub async fn wait(
        &self,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ListenerError> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.queue.lock();
                while let Some(event) = state.events.pop_front() {
                    if event.kind() == EventType::RuntimeDone {
                        if event.request_id() == Some(request_id) {
                            tracing::debug!(request_id, "Invocation finished");
                            return Ok(());
                        }
                    } else {
                        tracing::trace!(event_type = %event.event_type, "Skipping queued event");
                    }
                }
                if state.closed {
                    return Err(ListenerError::Closed);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ListenerError::Cancelled {
                        request_id: request_id.to_string(),
                    });
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Stops the server, giving in-flight requests [`SHUTDOWN_TIMEOUT`].
    ///
    /// Pending and future waits return [`ListenerError::Closed`] once the
    /// queue is drained. Calling this on a stopped listener does nothing.
    pub async fn shutdown(&mut self) -> Result<(), ListenerError> {
        self.queue.close();

        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.token.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, running.server).await {
            Ok(Ok(Ok(()))) => tracing::debug!("Telemetry listener stopped"),
            Ok(Ok(Err(error))) => tracing::warn!(%error, "Telemetry listener failed"),
            Ok(Err(error)) => tracing::warn!(%error, "Telemetry listener task panicked"),
            Err(_) => tracing::warn!("Telemetry listener did not stop within the shutdown timeout"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field(
                "mode",
                &match self.mode {
                    Mode::Queueing(_) => "queueing",
                    Mode::Translating(_) => "translating",
                },
            )
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

async fn bind(address: &str) -> Result<TcpListener, ListenerError> {
    TcpListener::bind(bind_target(address))
        .await
        .map_err(|source| ListenerError::Bind {
            address: address.to_string(),
            source,
        })
}

async fn handle_events(State(mode): State<Mode>, body: Bytes) -> StatusCode {
    let items: Vec<serde_json::Value> = match serde_json::from_slice(&body) {
        Ok(items) => items,
        Err(error) => {
            tracing::error!(%error, "Dropping malformed telemetry batch");
            return StatusCode::OK;
        }
    };

    let events: Vec<Event> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<Event>(item) {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::warn!(%error, "Skipping malformed telemetry event");
                None
            }
        })
        .collect();

    tracing::debug!(count = events.len(), "Received telemetry events");

    match mode {
        Mode::Queueing(queue) => queue.push(events),
        Mode::Translating(sink) => sink.handle(events).await,
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn post(addr: SocketAddr, body: impl Into<reqwest::Body>) -> reqwest::StatusCode {
        reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/", addr.port()))
            .body(body)
            .send()
            .await
            .unwrap()
            .status()
    }

    fn batch(events: &[(&str, serde_json::Value)]) -> String {
        let events: Vec<Event> = events
            .iter()
            .map(|(t, r)| Event::new("2022-10-12T00:00:00Z", *t, r.clone()))
            .collect();
        serde_json::to_string(&events).unwrap()
    }

    #[test]
    fn test_listen_address() {
        assert_eq!(listen_address(4325, false), "sandbox.localdomain:4325");
        assert_eq!(listen_address(4325, true), ":4325");
        assert_eq!(listener_uri(":4325"), "http://localhost:4325/");
        assert_eq!(
            listener_uri("sandbox.localdomain:4325"),
            "http://sandbox.localdomain:4325/"
        );
        assert_eq!(bind_target(":4325"), "0.0.0.0:4325");
    }

    #[tokio::test]
    async fn test_random_port_in_ephemeral_range() {
        let mut listener = Listener::queueing(true);
        let uri = listener.start(None).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(EPHEMERAL_PORTS.contains(&port));
        assert_eq!(uri, format!("http://localhost:{port}/"));
        assert!(matches!(
            listener.start(None).await,
            Err(ListenerError::AlreadyStarted)
        ));
        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_on_matching_runtime_done() {
        let mut listener = Listener::queueing(true);
        listener.start(None).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let body = batch(&[
            ("platform.start", json!({"requestId": "r1"})),
            ("function", json!("hello")),
            ("platform.runtimeDone", json!({"requestId": "r0", "status": "success"})),
            ("platform.runtimeDone", json!({"requestId": "r1", "status": "success"})),
            ("platform.report", json!({"requestId": "r1"})),
        ]);
        assert_eq!(post(addr, body).await, reqwest::StatusCode::OK);

        let cancel = CancellationToken::new();
        listener.wait("r1", &cancel).await.unwrap();
        // The report after the match stays queued for the next wait.
        assert_eq!(listener.queued(), 1);

        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_event_arrives() {
        let mut listener = Listener::queueing(true);
        listener.start(None).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = Arc::new(listener);

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                listener.wait("r2", &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let body = batch(&[(
            "platform.runtimeDone",
            json!({"requestId": "r2", "status": "success"}),
        )]);
        post(addr, body).await;

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let listener = Listener::queueing(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = listener.wait("r1", &cancel).await.unwrap_err();
        assert!(matches!(err, ListenerError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_wait_after_shutdown_is_closed() {
        let mut listener = Listener::queueing(true);
        listener.start(None).await.unwrap();
        listener.shutdown().await.unwrap();
        listener.shutdown().await.unwrap();

        let cancel = CancellationToken::new();
        let err = listener.wait("r1", &cancel).await.unwrap_err();
        assert!(matches!(err, ListenerError::Closed));
    }

    #[tokio::test]
    async fn test_malformed_body_is_acknowledged() {
        let mut listener = Listener::queueing(true);
        listener.start(None).await.unwrap();
        let addr = listener.local_addr().unwrap();

        assert_eq!(post(addr, "not json").await, reqwest::StatusCode::OK);
        assert_eq!(listener.queued(), 0);

        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_drop_batch() {
        let mut listener = Listener::queueing(true);
        listener.start(None).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let body = json!([
            {"type": "platform.start", "record": {"requestId": "r1"}},
            {"time": "2022-10-12T00:00:00Z", "type": 7, "record": {}},
            {
                "time": "2022-10-12T00:00:01Z",
                "type": "platform.runtimeDone",
                "record": {"requestId": "r1", "status": "success"}
            }
        ]);
        assert_eq!(post(addr, body.to_string()).await, reqwest::StatusCode::OK);
        assert_eq!(listener.queued(), 1);

        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(1), listener.wait("r1", &cancel))
            .await
            .expect("runtimeDone was queued")
            .unwrap();

        listener.shutdown().await.unwrap();
    }

    struct Counting(Mutex<usize>);

    impl EventSink for Counting {
        fn handle(&self, events: Vec<Event>) -> BoxFuture<'_, ()> {
            *self.0.lock().unwrap() += events.len();
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn test_translating_mode_hands_batches_to_sink() {
        let sink = Arc::new(Counting(Mutex::new(0)));
        let mut listener = Listener::translating(sink.clone(), true);
        listener.start(None).await.unwrap();
        let addr = listener.local_addr().unwrap();

        post(addr, batch(&[("function", json!("a")), ("function", json!("b"))])).await;

        assert_eq!(*sink.0.lock().unwrap(), 2);
        assert_eq!(listener.queued(), 0);
        listener.shutdown().await.unwrap();
    }
}
