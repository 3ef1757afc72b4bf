//! Error types for the collector extension.

use crate::config::ConfigError;
use crate::converter::ConvertError;
use crate::extension_api::ApiError;
use crate::listener::ListenerError;
use crate::pipeline::PipelineError;
use std::error::Error as _;
use thiserror::Error;

const MAX_ERROR_TYPE_LEN: usize = 1024;

/// A specialised Result type for extension operations.
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Errors that stop the extension.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Settings or the pipeline config could not be loaded.
    #[error("failed to load configuration")]
    Config(#[from] ConfigError),

    /// A call to the Extensions or Telemetry API failed.
    #[error("Lambda host API call failed")]
    Api(#[from] ApiError),

    /// The Telemetry listener failed.
    #[error("telemetry listener failed")]
    Listener(#[from] ListenerError),

    /// A config converter failed.
    #[error("failed to rewrite pipeline config")]
    Convert(#[from] ConvertError),

    /// The pipeline failed to build, start or stop.
    #[error("pipeline failed")]
    Pipeline(#[from] PipelineError),
}

impl CollectorError {
    /// Short category used in the error type reported to the host.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectorError::Config(_) => "Config",
            CollectorError::Api(e) if e.is_register() => "Register",
            CollectorError::Api(_) => "HostApi",
            CollectorError::Listener(_) => "Listener",
            CollectorError::Convert(_) => "Converter",
            CollectorError::Pipeline(_) => "Pipeline",
        }
    }

    /// `Extension.<Kind>: <message chain>`, restricted to printable ASCII so
    /// it fits in a header value.
    pub fn error_type(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        format!("Extension.{}: {}", self.kind(), message)
            .chars()
            .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
            .take(MAX_ERROR_TYPE_LEN)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_carries_chain() {
        let err = CollectorError::from(PipelineError::NoPipelines);
        assert_eq!(
            err.error_type(),
            "Extension.Pipeline: pipeline failed: no pipelines configured"
        );
    }

    #[test]
    fn test_error_type_is_header_safe() {
        let err = CollectorError::from(ApiError::Status {
            action: "register",
            status: 403,
            body: "denied\nnewline é".to_string(),
        });
        let error_type = err.error_type();
        assert!(error_type.starts_with("Extension.Register: "));
        assert!(error_type.chars().all(|c| c.is_ascii_graphic() || c == ' '));
    }

    #[test]
    fn test_error_type_is_truncated() {
        let err = CollectorError::from(ApiError::Status {
            action: "next",
            status: 500,
            body: "x".repeat(4096),
        });
        let error_type = err.error_type();
        assert!(error_type.starts_with("Extension.HostApi: "));
        assert_eq!(error_type.len(), MAX_ERROR_TYPE_LEN);
    }

    #[test]
    fn test_missing_runtime_api_is_config() {
        let err = CollectorError::from(ConfigError::MissingRuntimeApi);
        assert_eq!(err.kind(), "Config");
    }
}
