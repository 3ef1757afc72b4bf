//! Lambda Extensions API client.
//!
//! Registers the extension, long-polls for `INVOKE` and `SHUTDOWN` events and
//! reports fatal errors back to the host.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Extensions API version path segment.
pub const EXTENSION_API_VERSION: &str = "2020-01-01";

const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
const ACCEPT_FEATURE_HEADER: &str = "Lambda-Extension-Accept-Feature";
const ERROR_TYPE_HEADER: &str = "Lambda-Extension-Function-Error-Type";

/// Timeout for every call except the long-polling `next_event`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors talking to the Extensions or Telemetry API.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request could not be sent or the response not read.
    #[error("{action} request failed")]
    Http {
        /// API call that failed.
        action: &'static str,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The host answered with a non-success status.
    #[error("{action} failed with status {status}: {body}")]
    Status {
        /// API call that failed.
        action: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The response body was not the expected JSON.
    #[error("{action} returned an unexpected body")]
    Decode {
        /// API call that failed.
        action: &'static str,
        /// Decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// `register` succeeded without returning an extension identifier.
    #[error("register response is missing the Lambda-Extension-Identifier header")]
    MissingIdentifier,

    /// A call that needs an identifier was made before `register`.
    #[error("extension is not registered")]
    NotRegistered,

    /// The caller cancelled the request.
    #[error("{action} was cancelled")]
    Cancelled {
        /// API call that was cancelled.
        action: &'static str,
    },
}

impl ApiError {
    /// Returns true for errors raised while registering.
    pub fn is_register(&self) -> bool {
        match self {
            ApiError::MissingIdentifier => true,
            ApiError::Http { action, .. }
            | ApiError::Status { action, .. }
            | ApiError::Decode { action, .. }
            | ApiError::Cancelled { action } => *action == "register",
            ApiError::NotRegistered => false,
        }
    }

    pub(crate) fn http(action: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| ApiError::Http { action, source }
    }
}

/// Lifecycle events an extension can register for.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// A function invocation.
    Invoke,
    /// The execution environment is shutting down.
    Shutdown,
    /// An event kind this crate does not know.
    #[serde(other)]
    Unknown,
}

/// Body of a successful `register` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponse {
    /// Identifier returned in the `Lambda-Extension-Identifier` header.
    #[serde(skip)]
    pub extension_id: String,
    /// Function name.
    pub function_name: String,
    /// Function version.
    pub function_version: String,
    /// Function handler.
    pub handler: String,
    /// Account id, sent when the `accountId` feature was accepted.
    pub account_id: Option<String>,
}

/// Tracing header attached to an `INVOKE` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Tracing {
    /// Header type, e.g. `X-Amzn-Trace-Id`.
    #[serde(rename = "type")]
    pub trace_type: String,
    /// Header value.
    pub value: String,
}

/// An event returned by `next_event`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEvent {
    /// Event kind.
    pub event_type: EventKind,
    /// Invocation deadline in milliseconds since the Unix epoch.
    #[serde(default)]
    pub deadline_ms: i64,
    /// Invocation request id (`INVOKE` only).
    #[serde(default)]
    pub request_id: String,
    /// ARN the function was invoked with (`INVOKE` only).
    #[serde(default)]
    pub invoked_function_arn: String,
    /// Tracing header (`INVOKE` only).
    #[serde(default)]
    pub tracing: Option<Tracing>,
    /// Why the environment is shutting down (`SHUTDOWN` only).
    #[serde(default)]
    pub shutdown_reason: Option<String>,
}

/// Body of `init/error` and `exit/error` responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    /// Status reported by the host.
    pub status: String,
}

/// Client for `http://{AWS_LAMBDA_RUNTIME_API}/2020-01-01/extension`.
#[derive(Debug, Clone)]
pub struct ExtensionClient {
    base_url: String,
    client: Client,
    extension_id: Option<String>,
}

impl ExtensionClient {
    /// Creates a client for the given `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(runtime_api: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .build()
            .map_err(ApiError::http("client"))?;

        Ok(Self {
            base_url: format!("http://{runtime_api}/{EXTENSION_API_VERSION}/extension"),
            client,
            extension_id: None,
        })
    }

    /// Returns the identifier assigned by `register`.
    pub fn extension_id(&self) -> Option<&str> {
        self.extension_id.as_deref()
    }

    /// Registers the extension for `events` under `name`.
    pub async fn register(
        &mut self,
        name: &str,
        events: &[EventKind],
    ) -> Result<RegisterResponse, ApiError> {
        const ACTION: &str = "register";

        let response = self
            .client
            .post(format!("{}/register", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .header(EXTENSION_NAME_HEADER, name)
            .header(ACCEPT_FEATURE_HEADER, "accountId")
            .json(&serde_json::json!({ "events": events }))
            .send()
            .await
            .map_err(ApiError::http(ACTION))?;

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = success_body(ACTION, response).await?;
        let extension_id = extension_id
            .filter(|id| !id.is_empty())
            .ok_or(ApiError::MissingIdentifier)?;

        let mut registered: RegisterResponse = if body.trim().is_empty() {
            RegisterResponse::default()
        } else {
            serde_json::from_str(&body).map_err(|source| ApiError::Decode {
                action: ACTION,
                source,
            })?
        };
        registered.extension_id = extension_id.clone();
        self.extension_id = Some(extension_id);

        tracing::debug!(
            extension_id = %registered.extension_id,
            function_name = %registered.function_name,
            "Registered extension"
        );
        Ok(registered)
    }

    /// Blocks until the host delivers the next event or `cancel` fires.
    ///
    /// Cancellation drops the in-flight request.
    pub async fn next_event(&self, cancel: &CancellationToken) -> Result<NextEvent, ApiError> {
        const ACTION: &str = "next_event";
        let id = self.extension_id.as_deref().ok_or(ApiError::NotRegistered)?;

        let request = async {
            let response = self
                .client
                .get(format!("{}/event/next", self.base_url))
                .header(EXTENSION_ID_HEADER, id)
                .send()
                .await
                .map_err(ApiError::http(ACTION))?;

            let body = success_body(ACTION, response).await?;
            serde_json::from_str(&body).map_err(|source| ApiError::Decode {
                action: ACTION,
                source,
            })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::Cancelled { action: ACTION }),
            result = request => result,
        }
    }

    /// Reports a failure during initialization. The host then fails the
    /// init phase.
    pub async fn init_error(&self, error_type: &str) -> Result<StatusResponse, ApiError> {
        self.report_error("init_error", "init/error", error_type).await
    }

    /// Reports a failure before exiting.
    pub async fn exit_error(&self, error_type: &str) -> Result<StatusResponse, ApiError> {
        self.report_error("exit_error", "exit/error", error_type).await
    }

    async fn report_error(
        &self,
        action: &'static str,
        path: &str,
        error_type: &str,
    ) -> Result<StatusResponse, ApiError> {
        let id = self.extension_id.as_deref().ok_or(ApiError::NotRegistered)?;

        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .header(EXTENSION_ID_HEADER, id)
            .header(ERROR_TYPE_HEADER, error_type)
            .send()
            .await
            .map_err(ApiError::http(action))?;

        let body = success_body(action, response).await?;
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }
}

/// Returns the body of a 2xx response, or a status error carrying it.
pub(crate) async fn success_body(
    action: &'static str,
    response: reqwest::Response,
) -> Result<String, ApiError> {
    let status = response.status();
    let body = response.text().await.map_err(ApiError::http(action))?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(ApiError::Status {
            action,
            status: status.as_u16(),
            body,
        })
    }
}
