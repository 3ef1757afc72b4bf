//! Extension settings and pipeline config loading.
//!
//! Settings are layered with figment: compiled-in defaults, then the
//! environment variables the Lambda runtime and the user set.
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `AWS_LAMBDA_RUNTIME_API` | `runtime_api` |
//! | `AWS_SAM_LOCAL` | `sam_local` |
//! | `AWS_LAMBDA_INITIALIZATION_TYPE` | `init_type` |
//! | `OPENTELEMETRY_COLLECTOR_CONFIG_FILE` | `config_file` |
//! | `OPENTELEMETRY_COLLECTOR_CONFIG_CONTENT` | `config_content` |
//! | `OPENTELEMETRY_EXTENSION_LOG_LEVEL` | `log_level` |
//! | `OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE` | `metrics_temporality` |
//!
//! The pipeline config itself is YAML, read from `config_content` when set
//! and from `config_file` otherwise.

use crate::confmap::{ConfMap, ConfMapError};
use crate::translator::Temporality;
use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Pipeline config location used when none is set.
pub const DEFAULT_CONFIG_FILE: &str = "/opt/collector-config/config.yaml";

const CONFIG_CONTENT_ENV: &str = "OPENTELEMETRY_COLLECTOR_CONFIG_CONTENT";

/// Errors from loading settings or the pipeline config.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting has the wrong type.
    #[error("invalid extension settings")]
    Extract(#[source] Box<figment::Error>),

    /// `AWS_LAMBDA_RUNTIME_API` is not set.
    #[error("AWS_LAMBDA_RUNTIME_API is not set")]
    MissingRuntimeApi,

    /// The pipeline config file could not be read.
    #[error("failed to read pipeline config {path}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The pipeline config is not a valid YAML mapping.
    #[error("invalid pipeline config")]
    Parse(#[from] ConfMapError),
}

/// How the execution environment was initialized.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitType {
    /// Regular on-demand initialization.
    #[default]
    OnDemand,
    /// Provisioned concurrency.
    ProvisionedConcurrency,
    /// SnapStart restore.
    SnapStart,
    /// Lambda Managed Instances; the host sends no `INVOKE` events.
    LambdaManagedInstances,
}

impl InitType {
    /// Returns true when `INVOKE` events are delivered to extensions.
    pub fn receives_invokes(&self) -> bool {
        !matches!(self, InitType::LambdaManagedInstances)
    }
}

impl FromStr for InitType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-demand" => Ok(InitType::OnDemand),
            "provisioned-concurrency" => Ok(InitType::ProvisionedConcurrency),
            "snap-start" => Ok(InitType::SnapStart),
            "lambda-managed-instances" => Ok(InitType::LambdaManagedInstances),
            other => Err(format!("unknown initialization type {other:?}")),
        }
    }
}

impl fmt::Display for InitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitType::OnDemand => "on-demand",
            InitType::ProvisionedConcurrency => "provisioned-concurrency",
            InitType::SnapStart => "snap-start",
            InitType::LambdaManagedInstances => "lambda-managed-instances",
        })
    }
}

impl<'de> Deserialize<'de> for InitType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(value.parse().unwrap_or_else(|error: String| {
            tracing::warn!(%error, "Assuming on-demand initialization");
            InitType::OnDemand
        }))
    }
}

/// Extension settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host and port of the Lambda runtime API.
    pub runtime_api: Option<String>,
    /// Running under `sam local`.
    pub sam_local: bool,
    /// Initialization type.
    pub init_type: InitType,
    /// Pipeline config path or `file:` URI.
    pub config_file: String,
    /// Inline pipeline config; wins over `config_file`.
    pub config_content: Option<String>,
    /// Extension log level.
    pub log_level: String,
    /// Default temporality for translated metrics.
    pub metrics_temporality: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime_api: None,
            sam_local: false,
            init_type: InitType::OnDemand,
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            config_content: None,
            log_level: "warn".to_string(),
            metrics_temporality: None,
        }
    }
}

impl Settings {
    /// Loads settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be converted to its setting.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// The figment used by [`Settings::load`].
    pub fn figment() -> Figment {
        let env = Env::raw().filter_map(|key| {
            let setting = match key.as_str().to_ascii_uppercase().as_str() {
                "AWS_LAMBDA_RUNTIME_API" => "runtime_api",
                "AWS_SAM_LOCAL" => "sam_local",
                "AWS_LAMBDA_INITIALIZATION_TYPE" => "init_type",
                "OPENTELEMETRY_COLLECTOR_CONFIG_FILE" => "config_file",
                "OPENTELEMETRY_EXTENSION_LOG_LEVEL" => "log_level",
                "OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE" => "metrics_temporality",
                _ => return None,
            };
            Some(setting.into())
        });

        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(env);

        // Inline YAML must stay a string, so it bypasses figment's value parsing.
        if let Ok(content) = std::env::var(CONFIG_CONTENT_ENV) {
            figment = figment.merge(Serialized::default("config_content", content));
        }
        figment
    }

    /// Extracts settings from `figment`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value has the wrong type.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .extract()
            .map_err(|e| ConfigError::Extract(Box::new(e)))
    }

    /// Returns the runtime API address.
    pub fn require_runtime_api(&self) -> Result<&str, ConfigError> {
        self.runtime_api
            .as_deref()
            .filter(|api| !api.is_empty())
            .ok_or(ConfigError::MissingRuntimeApi)
    }

    /// Returns the temporality preference, ignoring unknown values.
    pub fn temporality(&self) -> Option<Temporality> {
        let value = self.metrics_temporality.as_deref()?;
        match value.parse() {
            Ok(temporality) => Some(temporality),
            Err(error) => {
                tracing::warn!(%error, "Ignoring metrics temporality preference");
                None
            }
        }
    }

    /// Returns the configured log level, or `None` when it is not one of
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub fn log_level(&self) -> Option<tracing::Level> {
        parse_log_level(&self.log_level)
    }

    /// Loads and env-expands the pipeline config.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a YAML mapping.
    pub fn load_pipeline_config(&self) -> Result<ConfMap, ConfigError> {
        let source = match self.config_content.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(content) => {
                tracing::debug!("Using inline pipeline config");
                content.to_string()
            }
            None => {
                let path = config_path(&self.config_file);
                tracing::debug!(path = %path.display(), "Reading pipeline config");
                std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?
            }
        };

        let mut conf = ConfMap::from_yaml(&source)?;
        conf.expand_env(|name| std::env::var(name).ok());
        Ok(conf)
    }
}

/// Strips a `file:` scheme from a config URI.
pub fn config_path(uri: &str) -> PathBuf {
    let path = uri
        .strip_prefix("file://")
        .or_else(|| uri.strip_prefix("file:"))
        .unwrap_or(uri);
    PathBuf::from(path)
}

/// Parses a log level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Option<tracing::Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

/// Durations as integer milliseconds, also accepting strings such as
/// `"200ms"`, `"5s"` or `"1m"` when deserializing.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    /// Serializes as integer milliseconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserializes integer milliseconds or a suffixed string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => parse(&text).ok_or_else(|| {
                de::Error::custom(format!("invalid duration {text:?}"))
            }),
        }
    }

    /// Parses `"<n>ms"`, `"<n>s"`, `"<n>m"` or a bare millisecond count.
    pub fn parse(text: &str) -> Option<Duration> {
        let text = text.trim();
        let (number, scale) = if let Some(n) = text.strip_suffix("ms") {
            (n, 0.001)
        } else if let Some(n) = text.strip_suffix('s') {
            (n, 1.0)
        } else if let Some(n) = text.strip_suffix('m') {
            (n, 60.0)
        } else {
            (text, 0.001)
        };
        let value: f64 = number.trim().parse().ok()?;
        (value.is_finite() && value >= 0.0).then(|| Duration::from_secs_f64(value * scale))
    }
}
