//! Lambda Telemetry API subscription.

use crate::extension_api::{ApiError, REQUEST_TIMEOUT, success_body};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

/// Telemetry API version path segment.
pub const TELEMETRY_API_VERSION: &str = "2022-07-01";
/// Event schema version requested on subscribe.
pub const SCHEMA_VERSION: &str = "2022-12-13";

const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Streams a subscription can select.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryType {
    /// Platform events (init, start, runtimeDone, report, …).
    Platform,
    /// Function logs from stdout/stderr.
    Function,
    /// Extension logs.
    Extension,
}

/// How the host batches events before pushing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    /// Maximum number of events per push.
    pub max_items: u32,
    /// Maximum bytes per push.
    pub max_bytes: u32,
    /// Maximum time in milliseconds an event is buffered.
    pub timeout_ms: u32,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            max_bytes: 256 * 1024,
            timeout_ms: 25,
        }
    }
}

/// Where the host pushes events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Always `HTTP`.
    pub protocol: String,
    /// Listener URI.
    #[serde(rename = "URI")]
    pub uri: String,
    /// Always `POST`.
    pub method: String,
    /// Always `JSON`.
    pub encoding: String,
}

impl DestinationConfig {
    /// An HTTP POST destination with JSON encoding.
    pub fn http(uri: impl Into<String>) -> Self {
        Self {
            protocol: "HTTP".to_string(),
            uri: uri.into(),
            method: "POST".to_string(),
            encoding: "JSON".to_string(),
        }
    }
}

/// Body of the subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySubscription {
    /// Schema version.
    pub schema_version: String,
    /// Streams to receive.
    pub types: Vec<TelemetryType>,
    /// Buffering configuration.
    pub buffering: BufferingConfig,
    /// Destination for events.
    pub destination: DestinationConfig,
}

impl TelemetrySubscription {
    /// Subscribes `listener_uri` to `types` with default buffering.
    pub fn new(types: Vec<TelemetryType>, listener_uri: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            types,
            buffering: BufferingConfig::default(),
            destination: DestinationConfig::http(listener_uri),
        }
    }

    /// Subscribes `listener_uri` to platform events only.
    pub fn platform_events(listener_uri: impl Into<String>) -> Self {
        Self::new(vec![TelemetryType::Platform], listener_uri)
    }

    /// Sets the buffering configuration.
    pub fn with_buffering(mut self, buffering: BufferingConfig) -> Self {
        self.buffering = buffering;
        self
    }
}

/// How the host answered a subscribe request.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Events will be delivered.
    Subscribed,
    /// The host accepted the request but will not deliver events, as in
    /// `sam local`.
    Accepted,
}

/// Client for `http://{AWS_LAMBDA_RUNTIME_API}/2022-07-01/telemetry`.
#[derive(Debug, Clone)]
pub struct TelemetryApiClient {
    url: String,
    client: Client,
}

impl TelemetryApiClient {
    /// Creates a client for the given `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(runtime_api: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ApiError::http("client"))?;

        Ok(Self {
            url: format!("http://{runtime_api}/{TELEMETRY_API_VERSION}/telemetry"),
            client,
        })
    }

    /// Subscribes the extension to the Telemetry API. Not retried.
    pub async fn subscribe(
        &self,
        extension_id: &str,
        subscription: &TelemetrySubscription,
    ) -> Result<SubscribeOutcome, ApiError> {
        const ACTION: &str = "subscribe";

        tracing::debug!(
            url = %self.url,
            types = ?subscription.types,
            uri = %subscription.destination.uri,
            "Subscribing to Telemetry API"
        );

        let response = self
            .client
            .put(&self.url)
            .header(EXTENSION_ID_HEADER, extension_id)
            .json(subscription)
            .send()
            .await
            .map_err(ApiError::http(ACTION))?;

        if response.status() == StatusCode::ACCEPTED {
            tracing::warn!(
                "Telemetry API subscription accepted but not supported; is this a local sandbox?"
            );
            return Ok(SubscribeOutcome::Accepted);
        }

        let body = success_body(ACTION, response).await?;
        tracing::debug!(response = %body, "Subscribed to Telemetry API");
        Ok(SubscribeOutcome::Subscribed)
    }
}
